//! Packet framing: header parsing and the 0xFFFFFF continuation rule.
//!
//! A logical MySQL payload larger than 16MiB - 1 is split across multiple
//! physical packets, each carrying the same sequence id rule (incrementing by
//! one per packet, physical or logical). [`read_payload`] reassembles those
//! into one buffer; [`write_payload`] does the reverse when writing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

const MAX_PACKET_PAYLOAD: usize = 0xFF_FF_FF;

/// MySQL packet header (zero-copy).
///
/// Layout matches the wire protocol: a 3-byte little-endian payload length
/// followed by a 1-byte sequence id.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub length: [u8; 3],
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn encode(length: usize, sequence_id: u8) -> Self {
        let len = u32::to_le_bytes(length as u32);
        Self {
            length: [len[0], len[1], len[2]],
            sequence_id,
        }
    }

    pub fn length(&self) -> usize {
        u32::from_le_bytes([self.length[0], self.length[1], self.length[2], 0]) as usize
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < 4 {
            return Err(Error::Interface("truncated packet header".into()));
        }
        Self::ref_from_bytes(&data[..4])
            .map_err(|_| Error::Interface("malformed packet header".into()))
    }
}

/// Read one logical payload, concatenating continuation packets.
///
/// Returns the sequence id of the last physical packet read, which the
/// caller must increment by one for its next write.
pub async fn read_payload<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut payload = Vec::new();
    let mut sequence_id = 0u8;

    loop {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let parsed = PacketHeader::from_bytes(&header)?;
        let length = parsed.length();
        sequence_id = parsed.sequence_id;

        let start = payload.len();
        payload.resize(start + length, 0);
        reader.read_exact(&mut payload[start..]).await?;

        if length < MAX_PACKET_PAYLOAD {
            return Ok((sequence_id, payload));
        }
    }
}

/// Write a logical payload as one or more physical packets, splitting at
/// `MAX_PACKET_PAYLOAD` boundaries. `sequence_id` is advanced past the last
/// packet written so the caller can reuse it for the next command.
pub async fn write_payload<W>(writer: &mut W, sequence_id: &mut u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0;
    loop {
        let remaining = payload.len() - offset;
        let chunk_len = remaining.min(MAX_PACKET_PAYLOAD);
        let header = PacketHeader::encode(chunk_len, *sequence_id);
        writer.write_all(header.as_bytes()).await?;
        writer
            .write_all(&payload[offset..offset + chunk_len])
            .await?;
        *sequence_id = sequence_id.wrapping_add(1);
        offset += chunk_len;

        if chunk_len < MAX_PACKET_PAYLOAD {
            break;
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_small_payload() {
        let mut buf = Vec::new();
        let mut seq = 0u8;
        write_payload(&mut buf, &mut seq, b"select 1").await.unwrap();
        assert_eq!(seq, 1);

        let mut cursor = std::io::Cursor::new(buf);
        let (read_seq, payload) = read_payload(&mut cursor).await.unwrap();
        assert_eq!(read_seq, 0);
        assert_eq!(payload, b"select 1");
    }

    #[tokio::test]
    async fn splits_and_reassembles_oversized_payload() {
        let payload = vec![0xABu8; MAX_PACKET_PAYLOAD + 10];
        let mut buf = Vec::new();
        let mut seq = 5u8;
        write_payload(&mut buf, &mut seq, &payload).await.unwrap();
        assert_eq!(seq, 7);

        let mut cursor = std::io::Cursor::new(buf);
        let (read_seq, reassembled) = read_payload(&mut cursor).await.unwrap();
        assert_eq!(read_seq, 6);
        assert_eq!(reassembled, payload);
    }
}
