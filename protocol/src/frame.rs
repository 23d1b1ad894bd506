//! Frame reader turning a byte stream into decoded responses.
//!
//! The link has no flow control and may deliver line noise, so the reader scans
//! for the preamble, skips whatever precedes it, and resynchronises on the next
//! preamble after a damaged frame.

use crate::{
    Error, Result, Timeout,
    packet::{DEVICE, HEADER_LEN, HOST, MAX_PAYLOAD_LEN, MIN_FRAME_LEN, PREAMBLE, Packet, PacketType},
    response::Response,
};
use core::fmt::Display;
use embedded_io_async::Read;
use log::{debug, trace};
use tokio::time::{self, Duration};

/// Size of the chunks requested from the port.
const CHUNK_SIZE: usize = 256;

/// Reads protocol frames from a port implementing [`Read`].
///
/// Waiting for the start of a frame is unbounded.
/// Once a preamble has been received, every further read must complete
/// within the frame timeout.
#[derive(Debug)]
pub struct FrameReader<R> {
    port: R,
    buf: Vec<u8>,
    frame_timeout: Duration,
}

impl<R: Read> FrameReader<R>
where
    R::Error: Display,
{
    /// Constructs a new frame reader for the given port.
    pub fn new(port: R, frame_timeout: Duration) -> Self {
        Self {
            port,
            buf: Vec::with_capacity(CHUNK_SIZE),
            frame_timeout,
        }
    }

    /// Returns the underlying port, discarding buffered bytes.
    pub fn into_inner(self) -> R {
        self.port
    }

    /// Reads the next frame and decodes it as a [`Response`].
    ///
    /// All errors except [`Error::AccessFailed`] are recoverable,
    /// the next call continues with the following frame.
    pub async fn next_response(&mut self) -> Result<Response> {
        let pkt = self.next_packet().await?;

        Response::decode(&pkt)
    }

    /// Reads the next frame with a valid checksum.
    ///
    /// A frame is only committed to once its header looks like a device reply.
    /// After a rejected header or checksum only the first preamble byte is
    /// dropped, so frames following a stray preamble byte are not lost.
    pub async fn next_packet(&mut self) -> Result<Packet> {
        loop {
            self.skip_garbage();

            let started = self.buf.starts_with(&PREAMBLE);

            if started && self.buf.len() >= MIN_FRAME_LEN - 1 {
                let len = match self.payload_len() {
                    Ok(len) => len,
                    Err(err) => {
                        self.buf.remove(0);

                        return Err(err);
                    }
                };
                let total = PREAMBLE.len() + HEADER_LEN + len + 1;

                if self.buf.len() >= total {
                    trace!("Received frame: {:02x?}", &self.buf[..total]);

                    let res = Packet::decode(&self.buf[PREAMBLE.len()..total]);

                    return match res {
                        Ok(pkt) if pkt.is_valid_crc() => {
                            self.buf.drain(..total);

                            Ok(pkt)
                        }
                        Ok(pkt) => {
                            self.buf.remove(0);

                            Err(Error::Crc {
                                expected: pkt.expected_checksum(),
                                actual: pkt.checksum,
                            })
                        }
                        Err(err) => {
                            self.buf.remove(0);

                            Err(err)
                        }
                    };
                }
            }

            self.fill(started).await?;
        }
    }

    /// Validates the buffered header and returns the announced payload length.
    fn payload_len(&self) -> Result<usize> {
        let (kind, from, to) = (self.buf[3], self.buf[4], self.buf[5]);

        if PacketType::from_repr(kind).is_none() {
            return Err(Error::invalid(format!("unknown packet type {kind:#04x}")));
        }

        if (from, to) != (DEVICE, HOST) {
            return Err(Error::invalid(format!("unexpected route {from:#04x} -> {to:#04x}")));
        }

        let len = usize::from(u16::from_le_bytes([self.buf[6], self.buf[7]]));

        if len > MAX_PAYLOAD_LEN {
            return Err(Error::invalid(format!(
                "payload length {len} exceeds maximum of {MAX_PAYLOAD_LEN}"
            )));
        }

        Ok(len)
    }

    /// Discards bytes that cannot belong to a frame.
    fn skip_garbage(&mut self) {
        let skip = match self
            .buf
            .windows(PREAMBLE.len())
            .position(|w| w == PREAMBLE)
        {
            Some(pos) => pos,
            // Trailing bytes may be the beginning of a preamble
            None => self.buf.len().saturating_sub(PREAMBLE.len() - 1),
        };

        if skip > 0 {
            debug!("Skipping {skip} bytes of garbage: {:02x?}", &self.buf[..skip]);
            self.buf.drain(..skip);
        }
    }

    /// Appends the next chunk received from the port to the buffer.
    async fn fill(&mut self, in_frame: bool) -> Result<()> {
        let mut chunk = [0x00; CHUNK_SIZE];
        let res = if in_frame {
            match time::timeout(self.frame_timeout, self.port.read(&mut chunk)).await {
                Ok(res) => res,
                Err(_) => return Err(self.abort_frame()),
            }
        } else {
            self.port.read(&mut chunk).await
        };
        let count = res.map_err(|err| Error::AccessFailed(err.to_string()))?;

        match count {
            0 if in_frame => Err(self.abort_frame()),
            0 => Err(Error::AccessFailed("unexpected end-of-file".into())),
            _ => {
                trace!("Read from port: {:02x?}", &chunk[..count]);
                self.buf.extend_from_slice(&chunk[..count]);

                Ok(())
            }
        }
    }

    /// Drops the first preamble byte so the next call resynchronises.
    fn abort_frame(&mut self) -> Error {
        debug!("Incomplete frame: {:02x?}", self.buf);
        self.buf.remove(0);

        Error::Timeout(Timeout::Frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        response::{Ack, Data, ResultCode},
        tests::init_logger,
    };

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn ack_frame(code: ResultCode) -> Vec<u8> {
        Response::Ack(Ack::new(code)).to_packet().encode()
    }

    #[tokio::test]
    async fn read_single_frame() -> Result<()> {
        init_logger();

        let frame = ack_frame(ResultCode::Ok);
        let mut reader = FrameReader::new(frame.as_slice(), TIMEOUT);

        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::Ok)),
            "response should be correct"
        );
        assert!(
            reader.into_inner().is_empty(),
            "port should be fully consumed"
        );

        Ok(())
    }

    #[tokio::test]
    async fn resync_across_garbage() -> Result<()> {
        init_logger();

        let mut stream = vec![0x12, 0xcc, 0x34, 0xcc, 0xcc, 0x56];

        stream.extend(ack_frame(ResultCode::Busy));
        stream.extend([0xcc, 0x00]);
        stream.extend(ack_frame(ResultCode::Ok));

        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);

        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::Busy)),
            "first response should be correct"
        );
        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::Ok)),
            "second response should be correct"
        );

        Ok(())
    }

    #[tokio::test]
    async fn garbage_resembling_preamble() -> Result<()> {
        init_logger();

        // Preamble bytes directly in front of a frame
        let mut stream = vec![0xcc, 0xcc];

        stream.extend(ack_frame(ResultCode::NotReady));

        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);

        // Headers read from the early preamble bytes start with 0xcc
        for _ in 0..2 {
            assert!(
                matches!(reader.next_response().await, Err(Error::InvalidData(_))),
                "misaligned header should be rejected"
            );
        }

        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::NotReady)),
            "response should be correct"
        );

        Ok(())
    }

    #[tokio::test]
    async fn stray_byte_costs_one_byte() -> Result<()> {
        init_logger();

        let mut stream = vec![0xcc];

        stream.extend(ack_frame(ResultCode::Busy));

        for timestamp in 0..60 {
            let data = Data {
                timestamp,
                measurements: Vec::new(),
            };

            stream.extend(Response::Data(data).to_packet().encode());
        }

        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);

        assert!(
            matches!(reader.next_response().await, Err(Error::InvalidData(_))),
            "misaligned header should be rejected"
        );
        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::Busy)),
            "ack should not be lost"
        );

        for timestamp in 0..60 {
            match reader.next_response().await? {
                Response::Data(data) => {
                    assert_eq!(data.timestamp, timestamp, "timestamp should be correct");
                }
                resp => panic!("unexpected response {resp:?}"),
            }
        }

        Ok(())
    }

    #[tokio::test]
    async fn bogus_length_does_not_swallow_frames() -> Result<()> {
        init_logger();

        let codes = [
            ResultCode::Busy,
            ResultCode::Ok,
            ResultCode::NotReady,
            ResultCode::Unknown,
            ResultCode::Ok,
        ];

        // Valid header announcing 40 bytes, followed by real frames
        let mut stream = vec![0xcc, 0xcc, 0xcc, 0xfa, 0xf1, 0xf0, 0x28, 0x00];

        for code in codes {
            stream.extend(ack_frame(code));
        }

        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);

        assert!(
            matches!(reader.next_response().await, Err(Error::Crc { .. })),
            "bogus frame should fail the checksum"
        );

        for code in codes {
            assert_eq!(
                reader.next_response().await?,
                Response::Ack(Ack::new(code)),
                "frames inside the bogus span should be read"
            );
        }

        Ok(())
    }

    #[tokio::test]
    async fn error_host_route() -> Result<()> {
        init_logger();

        let mut stream = Packet::new(PacketType::Ack, vec![0x00]).encode();

        stream.extend(ack_frame(ResultCode::Ok));

        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);

        assert!(
            matches!(reader.next_response().await, Err(Error::InvalidData(_))),
            "host-bound route should be rejected"
        );
        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::Ok)),
            "following frame should be intact"
        );

        Ok(())
    }

    #[tokio::test]
    async fn error_checksum() -> Result<()> {
        init_logger();

        let mut stream = ack_frame(ResultCode::Ok);

        if let Some(crc) = stream.last_mut() {
            *crc = crc.wrapping_add(1);
        }

        stream.extend(ack_frame(ResultCode::Busy));

        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);
        let expected = Packet::from_device(PacketType::Ack, vec![0x00]).checksum;

        assert_eq!(
            reader.next_response().await,
            Err(Error::Crc {
                expected,
                actual: expected.wrapping_add(1)
            }),
            "checksum error should be correct"
        );
        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::Busy)),
            "following frame should be intact"
        );

        Ok(())
    }

    #[tokio::test]
    async fn error_oversized_length() -> Result<()> {
        init_logger();

        // Length 0x0400 = 1024
        let mut stream = vec![0xcc, 0xcc, 0xcc, 0xfa, 0xf1, 0xf0, 0x00, 0x04, 0x00];

        stream.extend(ack_frame(ResultCode::Ok));

        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);

        assert!(
            matches!(reader.next_response().await, Err(Error::InvalidData(_))),
            "oversized frame should be rejected"
        );
        assert_eq!(
            reader.next_response().await?,
            Response::Ack(Ack::new(ResultCode::Ok)),
            "following frame should be intact"
        );

        Ok(())
    }

    #[tokio::test]
    async fn error_unknown_type() {
        init_logger();

        let stream = [0xcc, 0xcc, 0xcc, 0x33, 0xf1, 0xf0, 0x00, 0x00, 0x00];
        let mut reader = FrameReader::new(stream.as_slice(), TIMEOUT);

        assert!(
            matches!(reader.next_response().await, Err(Error::InvalidData(_))),
            "unknown packet type should be rejected"
        );
    }

    #[tokio::test]
    async fn error_incomplete_frame() {
        init_logger();

        let frame = ack_frame(ResultCode::Ok);
        let mut reader = FrameReader::new(&frame[..6], TIMEOUT);

        assert_eq!(
            reader.next_response().await,
            Err(Error::Timeout(Timeout::Frame)),
            "incomplete frame should time out"
        );
        assert_eq!(
            reader.next_response().await,
            Err(Error::AccessFailed("unexpected end-of-file".into())),
            "stream end should be reported"
        );
    }

    #[tokio::test]
    async fn error_end_of_stream() {
        init_logger();

        let mut reader = FrameReader::new([0x01, 0x02, 0x03].as_slice(), TIMEOUT);

        assert_eq!(
            reader.next_response().await,
            Err(Error::AccessFailed("unexpected end-of-file".into())),
            "stream end should be reported"
        );
    }
}
