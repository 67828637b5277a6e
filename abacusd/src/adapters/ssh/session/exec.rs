// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};

use crate::remote::ExecChannel;

#[derive(Debug, Default)]
struct ChannelState {
    stdout: VecDeque<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    closed: bool,
}

impl ChannelState {
    fn absorb(&mut self, msg: &ChannelMsg) {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend(data.iter().copied()),
            ChannelMsg::ExtendedData { data, ext: 1 } => self.stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_code = Some(*exit_status as i32),
            ChannelMsg::Eof | ChannelMsg::Close => self.closed = true,
            _ => {}
        }
    }

    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.stdout.len());
        for (slot, byte) in buf.iter_mut().zip(self.stdout.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// Exec channel over a russh session channel. Stderr is kept aside and logged
/// when the command finishes.
pub struct RusshExecChannel {
    channel: Channel<Msg>,
    state: ChannelState,
}

impl RusshExecChannel {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel,
            state: ChannelState::default(),
        }
    }
}

#[async_trait]
impl ExecChannel for RusshExecChannel {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await.context("channel write")?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.state.stdout.is_empty() {
                return Ok(self.state.drain_into(buf));
            }
            if self.state.closed {
                return Ok(0);
            }
            match self.channel.wait().await {
                Some(msg) => self.state.absorb(&msg),
                None => self.state.closed = true,
            }
        }
    }

    async fn finish(mut self: Box<Self>) -> Result<i32> {
        let _ = self.channel.eof().await;
        // Eof only means no more data; the exit status may still be in flight.
        loop {
            let Some(msg) = self.channel.wait().await else {
                break;
            };
            if matches!(msg, ChannelMsg::Close) {
                self.state.absorb(&msg);
                break;
            }
            self.state.absorb(&msg);
        }
        let _ = self.channel.close().await;
        if !self.state.stderr.is_empty() {
            log::debug!("stderr: {}", String::from_utf8_lossy(&self.state.stderr).trim_end());
        }
        Ok(self.state.exit_code.unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;

    #[test]
    fn absorb_separates_streams() {
        let mut state = ChannelState::default();
        state.absorb(&ChannelMsg::Data {
            data: CryptoVec::from_slice(b"hi"),
        });
        state.absorb(&ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"err"),
            ext: 1,
        });
        state.absorb(&ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"skip"),
            ext: 2,
        });
        assert_eq!(state.stdout.iter().copied().collect::<Vec<_>>(), b"hi");
        assert_eq!(state.stderr, b"err");
        assert!(state.exit_code.is_none());
        assert!(!state.closed);

        state.absorb(&ChannelMsg::ExitStatus { exit_status: 42 });
        assert_eq!(state.exit_code, Some(42));
        state.absorb(&ChannelMsg::Eof);
        assert!(state.closed);
    }

    #[test]
    fn drain_respects_buffer_size() {
        let mut state = ChannelState::default();
        state.absorb(&ChannelMsg::Data {
            data: CryptoVec::from_slice(b"abcdef"),
        });
        let mut buf = [0u8; 4];
        assert_eq!(state.drain_into(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(state.drain_into(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(state.drain_into(&mut buf), 0);
    }
}
