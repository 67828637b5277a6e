// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! SCP transfers driven over a plain exec channel.
//!
//! Every status exchange is a single byte: 0 ok, 1 warning, 2 fatal (both
//! followed by a message line), -1 when the channel hit EOF instead.

use anyhow::anyhow;
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ExecChannel, RemoteSession, sh_escape};

const CHUNK: usize = 32 * 1024;

/// The source sends its `C` control line straight away instead of a leading
/// zero; that marker is accepted where an ack is expected.
pub const DOWNLOAD_TOLERATED_ACK: i32 = b'C' as i32;

#[derive(Debug, ThisError)]
pub enum ScpError {
    #[error("scp channel failed: {0:#}")]
    Channel(#[from] anyhow::Error),
    #[error("reading the upload source failed: {0}")]
    Source(#[source] std::io::Error),
    #[error("upload source ended after {sent} of {expected} bytes")]
    ShortSource { sent: u64, expected: u64 },
    #[error("writing the download sink failed: {0}")]
    Sink(#[source] std::io::Error),
    #[error("malformed scp header: {0}")]
    Header(String),
}

async fn read_byte(channel: &mut dyn ExecChannel) -> Result<Option<u8>, ScpError> {
    let mut buf = [0u8; 1];
    let n = channel.read(&mut buf).await?;
    Ok((n == 1).then_some(buf[0]))
}

async fn read_line(channel: &mut dyn ExecChannel) -> Result<String, ScpError> {
    let mut line = Vec::new();
    while let Some(byte) = read_byte(channel).await? {
        if byte == b'\n' {
            break;
        }
        line.push(byte);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Reads one status byte. Warnings and errors carry a message line that is
/// consumed and logged here.
async fn read_ack(channel: &mut dyn ExecChannel) -> Result<i32, ScpError> {
    match read_byte(channel).await? {
        None => Ok(-1),
        Some(0) => Ok(0),
        Some(code @ (1 | 2)) => {
            let message = read_line(channel).await?;
            log::warn!("scp returned status {}: {}", code, message.trim_end());
            Ok(code as i32)
        }
        Some(other) => Ok(other as i32),
    }
}

async fn read_until(channel: &mut dyn ExecChannel, delimiter: u8) -> Result<String, ScpError> {
    let mut out = Vec::new();
    loop {
        match read_byte(channel).await? {
            Some(byte) if byte == delimiter => break,
            Some(byte) => out.push(byte),
            None => {
                return Err(ScpError::Header(format!(
                    "unexpected end of stream after '{}'",
                    String::from_utf8_lossy(&out)
                )));
            }
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

async fn abort(channel: Box<dyn ExecChannel>, code: i32) -> Result<i32, ScpError> {
    if let Err(err) = channel.finish().await {
        log::debug!("closing scp channel after status {code} failed: {err:#}");
    }
    Ok(code)
}

/// Streams exactly `size` bytes from `source` into `dest_path` on the remote host.
///
/// Returns 0 on success, otherwise the first non-zero ack or the command's exit
/// status. Failures reading `source` are reported as [`ScpError::Source`].
#[tracing::instrument(
    name = "ssh",
    level = "debug",
    skip_all,
    fields(op = "scp_upload", path = %dest_path, size = size)
)]
pub async fn scp_upload<R>(
    session: &dyn RemoteSession,
    size: u64,
    file_name: &str,
    dest_path: &str,
    permissions: &str,
    source: &mut R,
) -> Result<i32, ScpError>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    if file_name.contains('\n') || file_name.contains('/') {
        return Err(ScpError::Header(format!("invalid file name '{file_name}'")));
    }
    let mut channel = session
        .exec(&format!("scp -t {}", sh_escape(dest_path)))
        .await?;

    let ack = read_ack(channel.as_mut()).await?;
    if ack != 0 {
        return abort(channel, ack).await;
    }

    let header = format!("C{permissions} {size} {file_name}\n");
    channel.write_all(header.as_bytes()).await?;
    let ack = read_ack(channel.as_mut()).await?;
    if ack != 0 {
        return abort(channel, ack).await;
    }

    let mut buf = vec![0u8; CHUNK];
    let mut sent: u64 = 0;
    while sent < size {
        let want = (size - sent).min(CHUNK as u64) as usize;
        let n = source
            .read(&mut buf[..want])
            .await
            .map_err(ScpError::Source)?;
        if n == 0 {
            // Closing mid-transfer makes the remote scp fail instead of storing a
            // truncated file.
            let _ = channel.finish().await;
            return Err(ScpError::ShortSource {
                sent,
                expected: size,
            });
        }
        channel.write_all(&buf[..n]).await?;
        sent += n as u64;
    }

    channel.write_all(&[0]).await?;
    let ack = read_ack(channel.as_mut()).await?;
    if ack != 0 {
        return abort(channel, ack).await;
    }
    Ok(channel.finish().await?)
}

/// Copies `remote_path` into `sink`.
///
/// Returns the command's exit status, where -1 (no status reported) counts as 0.
/// A sink failure does not abort the protocol: the remaining bytes are drained
/// so the remote side finishes cleanly, then [`ScpError::Sink`] is returned.
#[tracing::instrument(
    name = "ssh",
    level = "debug",
    skip_all,
    fields(op = "scp_download", path = %remote_path)
)]
pub async fn scp_download<W>(
    session: &dyn RemoteSession,
    remote_path: &str,
    sink: &mut W,
) -> Result<i32, ScpError>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut channel = session
        .exec(&format!("scp -f {}", sh_escape(remote_path)))
        .await?;
    channel.write_all(&[0]).await?;

    let mut ack = read_ack(channel.as_mut()).await?;
    if ack == 0 {
        ack = read_ack(channel.as_mut()).await?;
    }
    if ack != DOWNLOAD_TOLERATED_ACK {
        return abort(channel, ack).await;
    }

    let mut mode = [0u8; 5];
    for slot in mode.iter_mut() {
        *slot = read_byte(channel.as_mut())
            .await?
            .ok_or_else(|| ScpError::Header("truncated permission field".into()))?;
    }
    let size_text = read_until(channel.as_mut(), b' ').await?;
    let size: u64 = size_text
        .trim()
        .parse()
        .map_err(|_| ScpError::Header(format!("invalid size '{size_text}'")))?;
    let name = read_until(channel.as_mut(), b'\n').await?;
    log::debug!(
        "receiving '{}' ({} bytes, mode {})",
        name,
        size,
        String::from_utf8_lossy(&mode).trim()
    );
    channel.write_all(&[0]).await?;

    let mut buf = vec![0u8; CHUNK];
    let mut remaining = size;
    let mut sink_error: Option<std::io::Error> = None;
    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let n = channel.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ScpError::Channel(anyhow!(
                "channel closed with {remaining} bytes outstanding"
            )));
        }
        remaining -= n as u64;
        if sink_error.is_none() {
            if let Err(err) = sink.write_all(&buf[..n]).await {
                sink_error = Some(err);
            }
        }
    }
    if sink_error.is_none() {
        if let Err(err) = sink.flush().await {
            sink_error = Some(err);
        }
    }

    let ack = read_ack(channel.as_mut()).await?;
    if ack != 0 {
        log::warn!("scp source reported status {ack} after data");
    }
    channel.write_all(&[0]).await?;
    let status = channel.finish().await?;

    if let Some(err) = sink_error {
        return Err(ScpError::Sink(err));
    }
    Ok(if status == -1 { 0 } else { status })
}
