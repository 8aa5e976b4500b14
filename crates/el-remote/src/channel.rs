//! Streaming channel adapter over a russh exec channel

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};

use el_core::error::RemoteError;
use el_core::remote::{ChannelAbort, ChannelEvent, RemoteChannel};

/// A live remote exec wrapped as a pollable event stream.
///
/// The abort handle lets cancellation and shutdown paths force-close the
/// channel without owning it; the next `next_event` call observes the abort,
/// closes the underlying channel, and reports `Closed`.
pub struct SshChannel {
    channel: Channel<Msg>,
    abort: ChannelAbort,
}

impl SshChannel {
    pub(crate) fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel,
            abort: ChannelAbort::new(),
        }
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn next_event(&mut self) -> Result<ChannelEvent, RemoteError> {
        loop {
            let msg = tokio::select! {
                _ = self.abort.aborted() => {
                    let _ = self.channel.close().await;
                    return Ok(ChannelEvent::Closed);
                }
                msg = self.channel.wait() => msg,
            };

            match msg {
                Some(ChannelMsg::Data { data }) => {
                    return Ok(ChannelEvent::Stdout(Bytes::copy_from_slice(&data)));
                }
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    return Ok(ChannelEvent::Stderr(Bytes::copy_from_slice(&data)));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Ok(ChannelEvent::Exit(exit_status as i32));
                }
                Some(_) => continue,
                None => return Ok(ChannelEvent::Closed),
            }
        }
    }

    fn abort_handle(&self) -> ChannelAbort {
        self.abort.clone()
    }
}
