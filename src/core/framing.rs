use crate::core::{deserialize, serialize, ClusterError, WireMsg};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Frames longer than this are rejected before allocation. Protocol frames
/// are tiny; mailbox payloads travel outside of frames.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// Reads one framed message: a big-endian `u32` length and that many bytes
/// of encoded body.
///
/// A connection closed cleanly between frames yields
/// [`ClusterError::TransportClosed`]; a close inside a frame yields
/// [`ClusterError::Framing`].
pub(crate) async fn read_msg<R>(r: &mut R) -> Result<WireMsg, ClusterError>
where
  R: AsyncRead + Unpin,
{
  let mut len_buf = [0u8; 4];
  let n = r
    .read(&mut len_buf)
    .await
    .map_err(|_| ClusterError::TransportClosed)?;
  if n == 0 {
    return Err(ClusterError::TransportClosed);
  }
  if n < 4 {
    r.read_exact(&mut len_buf[n..])
      .await
      .map_err(|_| ClusterError::Framing("connection closed inside a frame length"))?;
  }
  let len = u32::from_be_bytes(len_buf);
  if len > MAX_FRAME_LEN {
    return Err(ClusterError::Framing("frame length exceeds the cap"));
  }
  let mut body = vec![0u8; len as usize];
  r.read_exact(&mut body[..])
    .await
    .map_err(|_| ClusterError::Framing("connection closed inside a frame body"))?;
  deserialize::<WireMsg>(&body[..])
}

/// Writes one framed message.
pub(crate) async fn write_msg<W>(
  w: &mut W,
  msg: &WireMsg,
) -> Result<(), ClusterError>
where
  W: AsyncWrite + Unpin,
{
  let body = serialize(msg)?;
  if body.len() as u64 > MAX_FRAME_LEN as u64 {
    return Err(ClusterError::Framing("frame length exceeds the cap"));
  }
  let len = (body.len() as u32).to_be_bytes();
  w.write_all(&len[..])
    .await
    .map_err(|_| ClusterError::TransportClosed)?;
  w.write_all(&body[..])
    .await
    .map_err(|_| ClusterError::TransportClosed)?;
  Ok(())
}

/// Reads exactly `length` raw bytes following a header frame. The bytes are
/// consumed even when the receiver ends up dropping them, to keep the stream
/// in sync.
pub(crate) async fn read_payload<R>(
  r: &mut R,
  length: u64,
) -> Result<Vec<u8>, ClusterError>
where
  R: AsyncRead + Unpin,
{
  if length > MAX_FRAME_LEN as u64 {
    return Err(ClusterError::Framing("payload length exceeds the cap"));
  }
  let mut buf = vec![0u8; length as usize];
  r.read_exact(&mut buf[..])
    .await
    .map_err(|_| ClusterError::Framing("connection closed inside a payload"))?;
  Ok(buf)
}

/// The introduction stream handed to a joiner's startup function. Its length
/// is declared up-front by the contact; the startup function must consume
/// exactly that many bytes, and reads past the end fail.
pub struct IntroPipe {
  stream: TcpStream,
  remaining: Arc<AtomicU64>,
}
impl IntroPipe {
  pub(crate) fn new(stream: TcpStream, length: u64) -> (IntroPipe, Arc<AtomicU64>) {
    let remaining = Arc::new(AtomicU64::new(length));
    let pipe = IntroPipe {
      stream: stream,
      remaining: remaining.clone(),
    };
    (pipe, remaining)
  }

  /// Bytes of introduction not yet consumed.
  pub fn remaining(&self) -> u64 {
    self.remaining.load(Ordering::SeqCst)
  }

  /// Fills `buf` from the introduction.
  pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ClusterError> {
    if buf.len() as u64 > self.remaining() {
      return Err(ClusterError::Framing("read past the end of the introduction"));
    }
    self
      .stream
      .read_exact(buf)
      .await
      .map_err(|_| ClusterError::Framing("connection closed inside the introduction"))?;
    self.remaining.fetch_sub(buf.len() as u64, Ordering::SeqCst);
    Ok(())
  }

  /// Consumes the rest of the introduction.
  pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ClusterError> {
    let mut buf = vec![0u8; self.remaining() as usize];
    self.read_exact(&mut buf[..]).await?;
    Ok(buf)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::{AddrInfo, MsgKind};
  use std::net::Ipv4Addr;

  #[tokio::test]
  async fn frames_survive_the_stream() {
    let (mut a, mut b) = tokio::io::duplex(256);
    let msg = WireMsg::JoinPropose {
      addr: AddrInfo::new(Ipv4Addr::LOCALHOST, 17010, 4),
    };
    write_msg(&mut a, &msg).await.unwrap();
    write_msg(&mut a, &WireMsg::JoinRespond { accepted: true })
      .await
      .unwrap();
    assert_eq!(read_msg(&mut b).await.unwrap(), msg);
    assert_eq!(read_msg(&mut b).await.unwrap().kind(), MsgKind::JoinRespond);
  }

  #[tokio::test]
  async fn clean_close_is_transport_closed() {
    let (a, mut b) = tokio::io::duplex(256);
    drop(a);
    match read_msg(&mut b).await {
      Err(ClusterError::TransportClosed) => {}
      other => panic!("expected TransportClosed, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn truncated_frame_is_a_framing_error() {
    let (mut a, mut b) = tokio::io::duplex(256);
    a.write_all(&[0, 0, 0, 9, 1, 2]).await.unwrap();
    drop(a);
    match read_msg(&mut b).await {
      Err(ClusterError::Framing(_)) => {}
      other => panic!("expected Framing, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn payload_bytes_follow_their_header() {
    let (mut a, mut b) = tokio::io::duplex(256);
    let header = WireMsg::MailboxMsg {
      id: 1,
      length: 5,
      type_name: None,
    };
    write_msg(&mut a, &header).await.unwrap();
    a.write_all(b"hello").await.unwrap();
    assert_eq!(read_msg(&mut b).await.unwrap(), header);
    assert_eq!(read_payload(&mut b, 5).await.unwrap(), b"hello");
  }
}
