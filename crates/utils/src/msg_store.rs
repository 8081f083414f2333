use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
};

use futures::{StreamExt, future};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::BroadcastStream;

use crate::channel_msg::ChannelMsg;

// 20 MB per task. Generous for a single task's log+diff+state history, bounded so a
// long-running subprocess can't grow the in-process ring unboundedly.
const HISTORY_BYTES: usize = 20 * 1024 * 1024;

#[derive(Clone)]
struct StoredMsg {
    msg: ChannelMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
}

/// Per-task pub/sub: the State Store's three logical channels (log, diff, state) multiplexed
/// onto one broadcast stream, tagged by `ChannelMsg`'s variant. Late subscribers replay history
/// first, then receive live frames - "most subscribers connected at time T receive frames
/// published at T", no stronger guarantee.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<ChannelMsg>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(10000);
        Self {
            inner: RwLock::new(Inner { history: VecDeque::with_capacity(64), total_bytes: 0 }),
            sender,
        }
    }

    pub fn push(&self, msg: ChannelMsg) {
        let _ = self.sender.send(msg.clone());
        let bytes = msg.approx_bytes();

        let mut inner = self.inner.write().unwrap();
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredMsg { msg, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    pub fn push_log<S: Into<String>>(&self, s: S) {
        self.push(ChannelMsg::log(s));
    }

    pub fn push_diff<S: Into<String>>(&self, s: S) {
        self.push(ChannelMsg::diff(s));
    }

    pub fn push_state(&self, v: serde_json::Value) {
        self.push(ChannelMsg::state(v));
    }

    pub fn push_finished(&self) {
        self.push(ChannelMsg::Finished);
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<ChannelMsg> {
        self.sender.subscribe()
    }

    pub fn get_history(&self) -> Vec<ChannelMsg> {
        self.inner.read().unwrap().history.iter().map(|s| s.msg.clone()).collect()
    }

    /// History then live, as `ChannelMsg`.
    pub fn history_plus_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<ChannelMsg, std::io::Error>> {
        let (history, rx) = (self.get_history(), self.get_receiver());

        let hist = futures::stream::iter(history.into_iter().map(Ok::<_, std::io::Error>));
        let live = BroadcastStream::new(rx)
            .filter_map(|res| async move { res.ok().map(Ok::<_, std::io::Error>) });

        Box::pin(hist.chain(live))
    }

    pub fn log_lines_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<String, std::io::Error>> {
        self.history_plus_stream()
            .take_while(|res| future::ready(!matches!(res, Ok(ChannelMsg::Finished))))
            .filter_map(|res| async move {
                match res {
                    Ok(ChannelMsg::Log { data, .. }) => Some(Ok(data)),
                    _ => None,
                }
            })
            .boxed()
    }

    /// Forward a stream of already-typed channel messages into this store (used to relay
    /// container-runner log/diff output as it's produced).
    pub fn spawn_forwarder<S, E>(self: Arc<Self>, stream: S) -> JoinHandle<()>
    where
        S: futures::Stream<Item = Result<ChannelMsg, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(next) = stream.next().await {
                match next {
                    Ok(msg) => self.push(msg),
                    Err(e) => self.push_log(format!("stream error: {e}")),
                }
            }
        })
    }
}
