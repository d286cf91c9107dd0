use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Decoder for the lounge long-poll framing: `<byte length>\n<payload>`,
/// repeated. Payloads are JSON event arrays.
#[derive(Default)]
pub struct FrameCodec {
    pending: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.pending {
                None => {
                    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
                        return Ok(None);
                    };
                    let header = buf.split_to(newline + 1);
                    let digits = &header[..header.len() - 1];
                    let size = parse_size(digits).ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "expected numeric frame size, got {:?}",
                                String::from_utf8_lossy(digits)
                            ),
                        )
                    })?;
                    self.pending = Some(size);
                }
                Some(size) => {
                    if buf.len() < size {
                        buf.reserve(size - buf.len());
                        return Ok(None);
                    }
                    let payload = buf.copy_to_bytes(size);
                    self.pending = None;
                    let frame = String::from_utf8(payload.to_vec()).map_err(|_| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "frame payload is not utf-8",
                        )
                    })?;
                    return Ok(Some(frame));
                }
            }
        }
    }
}

fn parse_size(digits: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(digits).ok()?.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}
