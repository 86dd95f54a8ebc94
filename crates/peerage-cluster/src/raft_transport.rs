//! TCP framing for raft RPC messages.
//!
//! Each frame is a 4-byte big-endian length followed by a bincode payload.
//! `RaftNetworkClient` sends one request frame per connection and
//! `spawn_raft_listener` answers with one response frame. Besides the raft
//! protocol itself, the same listener takes topology proposals forwarded
//! by followers and liveness pings.

use std::io;

use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::consensus::ConsensusError;
use crate::raft::TypeConfig;
use crate::topology::{CommittedEntry, PeerId, TopologyChange};

/// Upper bound on a single frame. Topology snapshots are small; anything
/// larger is a corrupt or hostile length prefix.
pub(crate) const MAX_RAFT_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// An inbound raft RPC.
#[derive(Serialize, Deserialize)]
pub(crate) enum RaftRpc {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<u64>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// A topology change a follower forwards to the leader.
    Propose(TopologyChange),
    Ping { from: PeerId },
}

/// A raft RPC response.
#[derive(Serialize, Deserialize)]
pub(crate) enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<u64>),
    Vote(VoteResponse<u64>),
    InstallSnapshot(InstallSnapshotResponse<u64>),
    Propose(Result<CommittedEntry, ConsensusError>),
    Pong,
}

/// Writes a length-prefixed bincode frame to `w`.
pub(crate) async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data =
        bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() > MAX_RAFT_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("raft frame size {} exceeds limit {MAX_RAFT_FRAME_SIZE}", data.len()),
        ));
    }
    let len = data.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await
}

/// Reads a length-prefixed bincode frame from `r`, rejecting oversized frames.
pub(crate) async fn read_frame<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RAFT_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("raft frame size {len} exceeds limit {MAX_RAFT_FRAME_SIZE}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    bincode::deserialize(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, LogId, Vote};

    #[tokio::test]
    async fn vote_request_survives_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let req = VoteRequest::new(
            Vote::new(3, 2),
            Some(LogId::new(CommittedLeaderId::new(2, 1), 7)),
        );
        write_frame(&mut client, &RaftRpc::Vote(req.clone())).await.unwrap();

        let received: RaftRpc = read_frame(&mut server).await.unwrap();
        match received {
            RaftRpc::Vote(got) => {
                assert_eq!(got.vote, req.vote);
                assert_eq!(got.last_log_id, req.last_log_id);
            }
            _ => panic!("expected a vote request"),
        }
    }

    #[tokio::test]
    async fn forwarded_proposal_result_survives_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let conflict: Result<CommittedEntry, ConsensusError> = Err(ConsensusError::Conflict {
            expected: 4,
            current: 5,
        });
        write_frame(&mut client, &RaftRpcResponse::Propose(conflict.clone()))
            .await
            .unwrap();

        match read_frame(&mut server).await.unwrap() {
            RaftRpcResponse::Propose(got) => assert_eq!(got, conflict),
            _ => panic!("expected a propose response"),
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_RAFT_FRAME_SIZE as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_frame::<_, RaftRpc>(&mut server).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_errors() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&16u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0u8; 4]).await.unwrap();
        drop(client);

        let err = read_frame::<_, RaftRpc>(&mut server).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
