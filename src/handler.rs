use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio_util::sync::CancellationToken;
use crate::log_entry::LogEntryProducer;

/// A term-stamped RPC outcome as produced by the consensus layer
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RaftResult<T> {
    pub term: i64,
    pub value: T,
}
impl<T> RaftResult<T> {
    pub fn new(term: i64, value: T) -> RaftResult<T> {
        RaftResult { term, value }
    }
}

/// This is the contract between the transport and the consensus logic on the server side. The
///  transport calls exactly one of these functions per completely received request, and sends
///  the returned value back verbatim.
///
/// The cancellation token is triggered when the server shuts down.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RaftRpcHandler: Send + Sync + 'static {
    async fn resign(&self, cancel: CancellationToken) -> bool;

    async fn receive_vote(&self, sender: SocketAddr, term: i64, last_log_index: i64, last_log_term: i64, cancel: CancellationToken) -> RaftResult<bool>;

    /// `entries` yields the entries in the order the leader produced them, reassembled from
    ///  however many datagrams they arrived in
    #[allow(clippy::too_many_arguments)]
    async fn receive_entries(&self, sender: SocketAddr, term: i64, entries: Box<dyn LogEntryProducer>, prev_log_index: i64, prev_log_term: i64, commit_index: i64, cancel: CancellationToken) -> RaftResult<bool>;

    fn metadata(&self) -> Arc<BTreeMap<String, String>>;
}
