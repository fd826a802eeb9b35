//! Packet framing codec for Minecraft protocol.
//!
//! Minecraft packets are framed as:
//! - `[VarInt length][VarInt packet_id][payload...]`
//!
//! Once compression is enabled the frame becomes
//! `[VarInt length][VarInt data_length][zlib(packet_id + payload)]`, where a
//! `data_length` of 0 marks a body that was left uncompressed. Encryption
//! (AES-128-CFB8) wraps everything, length prefix included.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tokio_util::codec::{Decoder, Encoder};

use crate::cipher::{Cfb8Cipher, SHARED_SECRET_LEN};
use crate::error::{ProtocolError, Result};
use crate::varint::{peek_varint, read_varint, varint_len, write_varint};

/// Maximum packet size (2 MiB, same as vanilla).
pub const MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;

/// Maximum size of a packet once inflated (8 MiB, same as vanilla).
pub const MAX_UNCOMPRESSED_SIZE: usize = 8 * 1024 * 1024;

/// A raw packet with its ID and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// The packet ID.
    pub id: i32,
    /// The packet payload (without the packet ID).
    pub payload: BytesMut,
}

impl RawPacket {
    /// Create a new raw packet with the given ID and payload.
    #[must_use]
    pub const fn new(id: i32, payload: BytesMut) -> Self {
        Self { id, payload }
    }

    /// Create a new raw packet with the given ID and an empty payload.
    #[must_use]
    pub fn empty(id: i32) -> Self {
        Self {
            id,
            payload: BytesMut::new(),
        }
    }

    /// Size of the packet ID plus payload.
    #[must_use]
    pub fn data_len(&self) -> usize {
        varint_len(self.id) + self.payload.len()
    }
}

/// Stateful framing codec for one direction of a connection.
///
/// A connection keeps two instances: the reader task owns the one used for
/// decoding and the writer task owns the one used for encoding. Each only
/// ever touches its own half of the state.
#[derive(Debug)]
pub struct PacketCodec {
    max_frame_len: usize,
    compression: Option<usize>,
    encryptor: Option<Cfb8Cipher>,
    decryptor: Option<Cfb8Cipher>,
    /// Bytes at the front of the decode buffer that are already plaintext.
    decrypted: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl PacketCodec {
    /// Create a codec with no compression or encryption.
    #[must_use]
    pub const fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            compression: None,
            encryptor: None,
            decryptor: None,
            decrypted: 0,
        }
    }

    /// Install a compression threshold. A negative threshold disables compression.
    pub fn set_compression(&mut self, threshold: i32) {
        self.compression = usize::try_from(threshold).ok();
    }

    /// The active compression threshold, if compression is enabled.
    #[must_use]
    pub const fn compression_threshold(&self) -> Option<usize> {
        self.compression
    }

    /// Start encrypting and decrypting with the given shared secret.
    ///
    /// Bytes already sitting in the decode buffer are treated as ciphertext.
    pub fn enable_encryption(&mut self, secret: &[u8; SHARED_SECRET_LEN]) {
        self.encryptor = Some(Cfb8Cipher::from_shared_secret(secret));
        self.decryptor = Some(Cfb8Cipher::from_shared_secret(secret));
        self.decrypted = 0;
    }

    /// Whether encryption is enabled.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }

    /// The configured frame size limit.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn decode_frame(&self, mut frame: BytesMut) -> Result<RawPacket> {
        if self.compression.is_some() {
            let data_len = read_varint(&mut frame)?;
            if data_len != 0 {
                let expected =
                    usize::try_from(data_len).map_err(|_| ProtocolError::NegativeLength(data_len))?;
                if expected > MAX_UNCOMPRESSED_SIZE {
                    return Err(ProtocolError::DecompressionMismatch {
                        expected,
                        actual: MAX_UNCOMPRESSED_SIZE,
                    });
                }
                frame = inflate(&frame, expected)?;
            }
        }

        let id = read_varint(&mut frame)?;
        Ok(RawPacket::new(id, frame))
    }

    fn check_frame_len(&self, len: usize) -> Result<()> {
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = RawPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawPacket>> {
        if let Some(decryptor) = &mut self.decryptor
            && self.decrypted < src.len()
        {
            decryptor.decrypt(&mut src[self.decrypted..]);
            self.decrypted = src.len();
        }

        let Some((len, prefix_len)) = peek_varint(src)? else {
            return Ok(None);
        };
        let len = usize::try_from(len).map_err(|_| ProtocolError::NegativeLength(len))?;
        self.check_frame_len(len)?;

        let total = prefix_len + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let frame = src.split_to(len);
        if self.decryptor.is_some() {
            self.decrypted -= total;
        }

        self.decode_frame(frame).map(Some)
    }
}

impl Encoder<RawPacket> for PacketCodec {
    type Error = ProtocolError;

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn encode(&mut self, packet: RawPacket, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        let data_len = packet.data_len();

        match self.compression {
            Some(threshold) if data_len >= threshold => {
                if data_len > MAX_UNCOMPRESSED_SIZE {
                    return Err(ProtocolError::FrameTooLarge {
                        len: data_len,
                        max: MAX_UNCOMPRESSED_SIZE,
                    });
                }
                let mut data = BytesMut::with_capacity(data_len);
                write_varint(&mut data, packet.id);
                data.put_slice(&packet.payload);
                let compressed = deflate(&data)?;

                let frame_len = varint_len(data_len as i32) + compressed.len();
                self.check_frame_len(frame_len)?;
                dst.reserve(varint_len(frame_len as i32) + frame_len);
                write_varint(dst, frame_len as i32);
                write_varint(dst, data_len as i32);
                dst.put_slice(&compressed);
            }
            Some(_) => {
                let frame_len = 1 + data_len;
                self.check_frame_len(frame_len)?;
                dst.reserve(varint_len(frame_len as i32) + frame_len);
                write_varint(dst, frame_len as i32);
                dst.put_u8(0);
                write_varint(dst, packet.id);
                dst.put_slice(&packet.payload);
            }
            None => {
                self.check_frame_len(data_len)?;
                dst.reserve(varint_len(data_len as i32) + data_len);
                write_varint(dst, data_len as i32);
                write_varint(dst, packet.id);
                dst.put_slice(&packet.payload);
            }
        }

        if let Some(encryptor) = &mut self.encryptor {
            encryptor.encrypt(&mut dst[start..]);
        }
        Ok(())
    }
}

fn inflate(compressed: &[u8], expected: usize) -> Result<BytesMut> {
    let mut out = Vec::with_capacity(expected);
    // Read one byte past the declared size so an oversized body is noticed
    ZlibDecoder::new(compressed)
        .take(expected as u64 + 1)
        .read_to_end(&mut out)?;

    if out.len() != expected {
        return Err(ProtocolError::DecompressionMismatch {
            expected,
            actual: out.len(),
        });
    }
    Ok(BytesMut::from(&out[..]))
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
