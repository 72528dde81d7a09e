//! Pooled packet buffers
//!
//! A `PacketBuffer` owns a fixed backing array with `TUN_HEADER_OFFSET`
//! bytes of headroom. After `parse()` the source and destination addresses
//! are exposed as views into the payload; they are stored as offsets so the
//! views can never outlive the packet region they alias.

use std::sync::{Mutex, PoisonError};

use futures::io::{AsyncRead, AsyncReadExt};

use crate::{checksum, IPV4_HEADER_LEN, IPV6_HEADER_LEN, MAX_CONTENT_SIZE, TUN_HEADER_OFFSET};

const IPV4_OFFSET_SRC: usize = 12;
const IPV4_OFFSET_DST: usize = 16;
const IPV6_OFFSET_SRC: usize = 8;
const IPV6_OFFSET_DST: usize = 24;

/// Offsets of the address views inside the packet region.
#[derive(Debug, Clone, Copy)]
struct AddrViews {
    src: usize,
    dst: usize,
    width: usize,
}

/// A reusable packet buffer with a header-offset convention.
///
/// Lifecycle: checked out of a [`PacketPool`], filled by a reader, handed
/// to exactly one consumer, returned to the pool.
pub struct PacketBuffer {
    buffer: [u8; MAX_CONTENT_SIZE],
    len: usize,
    views: Option<AddrViews>,
    is_ipv6: bool,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuffer {
    /// A fresh zero-initialized buffer with no payload.
    pub fn new() -> Self {
        Self {
            buffer: [0; MAX_CONTENT_SIZE],
            len: 0,
            views: None,
            is_ipv6: false,
        }
    }

    /// The whole backing array, headroom included.
    pub fn buffer_mut(&mut self) -> &mut [u8; MAX_CONTENT_SIZE] {
        &mut self.buffer
    }

    /// The current packet region.
    pub fn packet(&self) -> &[u8] {
        &self.buffer[TUN_HEADER_OFFSET..TUN_HEADER_OFFSET + self.len]
    }

    /// Mutable access to the current packet region.
    pub fn packet_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[TUN_HEADER_OFFSET..TUN_HEADER_OFFSET + self.len]
    }

    /// Declare `len` payload bytes starting at the header offset.
    ///
    /// Any previous address views are invalidated.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= MAX_CONTENT_SIZE - TUN_HEADER_OFFSET);
        self.len = len;
        self.views = None;
        self.is_ipv6 = false;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_ipv6(&self) -> bool {
        self.is_ipv6
    }

    /// Locate the IP version and the source/destination address views.
    ///
    /// Returns false when the payload is not a plausible IPv4/IPv6 packet;
    /// the buffer is unusable until cleared or refilled.
    pub fn parse(&mut self) -> bool {
        let packet = self.packet();
        if packet.is_empty() {
            return false;
        }

        match packet[0] >> 4 {
            4 => {
                if packet.len() < IPV4_HEADER_LEN {
                    return false;
                }
                self.views = Some(AddrViews {
                    src: IPV4_OFFSET_SRC,
                    dst: IPV4_OFFSET_DST,
                    width: 4,
                });
                self.is_ipv6 = false;
            }
            6 => {
                if packet.len() < IPV6_HEADER_LEN {
                    return false;
                }
                self.views = Some(AddrViews {
                    src: IPV6_OFFSET_SRC,
                    dst: IPV6_OFFSET_DST,
                    width: 16,
                });
                self.is_ipv6 = true;
            }
            _ => return false,
        }

        true
    }

    /// The source address view, present after a successful `parse`.
    pub fn src(&self) -> Option<&[u8]> {
        let v = self.views?;
        Some(&self.packet()[v.src..v.src + v.width])
    }

    /// The destination address view, present after a successful `parse`.
    pub fn dst(&self) -> Option<&[u8]> {
        let v = self.views?;
        Some(&self.packet()[v.dst..v.dst + v.width])
    }

    /// Overwrite the source address through its view. No-op before `parse`.
    pub fn set_src(&mut self, addr: &[u8]) {
        if let Some(v) = self.views {
            let n = v.width.min(addr.len());
            let start = TUN_HEADER_OFFSET + v.src;
            self.buffer[start..start + n].copy_from_slice(&addr[..n]);
        }
    }

    /// Overwrite the destination address through its view. No-op before `parse`.
    pub fn set_dst(&mut self, addr: &[u8]) {
        if let Some(v) = self.views {
            let n = v.width.min(addr.len());
            let start = TUN_HEADER_OFFSET + v.dst;
            self.buffer[start..start + n].copy_from_slice(&addr[..n]);
        }
    }

    /// Regenerate the IP header and transport checksums in place.
    pub fn recalculate_checksum(&mut self) {
        let is_ipv6 = self.is_ipv6;
        checksum::recalculate_checksum(self.packet_mut(), is_ipv6);
    }

    /// Drop the payload and the address views. The backing array keeps its
    /// bytes; it is reused, not re-zeroed.
    pub fn clear(&mut self) {
        self.len = 0;
        self.views = None;
        self.is_ipv6 = false;
    }

    /// Fill the buffer from `stream` until EOF, starting at the header
    /// offset. Returns the number of payload bytes read.
    ///
    /// This is the peer-ingress path: the transport frames one packet per
    /// stream, so EOF delimits the packet.
    pub async fn read_from<R>(&mut self, stream: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut total = TUN_HEADER_OFFSET;
        loop {
            let n = stream.read(&mut self.buffer[total..]).await?;
            if n == 0 {
                self.len = total - TUN_HEADER_OFFSET;
                self.views = None;
                self.is_ipv6 = false;
                return Ok(self.len);
            }
            total += n;
        }
    }
}

/// Thread-safe free-list of packet buffers.
///
/// Buffers are clean (empty payload, no views) whenever they sit in the
/// pool. Checked-out buffers are exclusively owned until returned.
#[derive(Default)]
pub struct PacketPool {
    free: Mutex<Vec<Box<PacketBuffer>>>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a buffer out, allocating when the free-list is empty.
    pub fn get(&self) -> Box<PacketBuffer> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.pop().unwrap_or_else(|| Box::new(PacketBuffer::new()))
    }

    /// Clear a buffer and check it back in.
    pub fn put(&self, mut buffer: Box<PacketBuffer>) {
        buffer.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.push(buffer);
    }

    /// Current free-list population.
    pub fn size(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(payload: &[u8]) -> PacketBuffer {
        let mut buffer = PacketBuffer::new();
        buffer.buffer_mut()[TUN_HEADER_OFFSET..TUN_HEADER_OFFSET + payload.len()]
            .copy_from_slice(payload);
        buffer.set_len(payload.len());
        buffer
    }

    fn ipv4_header(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut header = vec![0x45u8, 0, 0, 20, 0, 1, 0, 0, 64, 17, 0, 0];
        header.extend_from_slice(&src);
        header.extend_from_slice(&dst);
        header
    }

    #[test]
    fn parse_ipv4_views() {
        let mut buffer = filled(&ipv4_header([10, 0, 0, 1], [10, 0, 0, 2]));
        assert!(buffer.parse());
        assert!(!buffer.is_ipv6());
        assert_eq!(buffer.src(), Some(&[10, 0, 0, 1][..]));
        assert_eq!(buffer.dst(), Some(&[10, 0, 0, 2][..]));
    }

    #[test]
    fn parse_ipv6_views() {
        let mut payload = vec![0u8; IPV6_HEADER_LEN];
        payload[0] = 0x60;
        for (i, b) in payload[8..24].iter_mut().enumerate() {
            *b = i as u8;
        }
        for b in payload[24..40].iter_mut() {
            *b = 0xfe;
        }
        let mut buffer = filled(&payload);
        assert!(buffer.parse());
        assert!(buffer.is_ipv6());
        assert_eq!(buffer.src().map(<[u8]>::len), Some(16));
        assert_eq!(buffer.dst(), Some(&[0xfe; 16][..]));
    }

    #[test]
    fn parse_rejects_runts_and_bad_versions() {
        assert!(!filled(&[0x45]).parse());
        assert!(!filled(&vec![0x45; IPV4_HEADER_LEN - 1]).parse());
        assert!(!filled(&vec![0x60; IPV6_HEADER_LEN - 1]).parse());
        assert!(!filled(&[0x25; 40]).parse());
        assert!(!filled(&[]).parse());
    }

    #[test]
    fn parse_boundary_lengths_succeed() {
        assert!(filled(&{
            let mut p = vec![0u8; IPV4_HEADER_LEN];
            p[0] = 0x45;
            p
        })
        .parse());
        assert!(filled(&{
            let mut p = vec![0u8; IPV6_HEADER_LEN];
            p[0] = 0x60;
            p
        })
        .parse());
    }

    #[test]
    fn set_src_rewrites_packet_bytes() {
        let mut buffer = filled(&ipv4_header([10, 0, 0, 1], [10, 0, 0, 2]));
        assert!(buffer.parse());
        buffer.set_src(&[192, 168, 1, 5]);
        buffer.set_dst(&[10, 66, 0, 1]);
        assert_eq!(&buffer.packet()[12..16], &[192, 168, 1, 5]);
        assert_eq!(&buffer.packet()[16..20], &[10, 66, 0, 1]);
    }

    #[test]
    fn clear_drops_views_but_keeps_bytes() {
        let mut buffer = filled(&ipv4_header([10, 0, 0, 1], [10, 0, 0, 2]));
        assert!(buffer.parse());
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.src().is_none());
        assert!(!buffer.is_ipv6());
        // Backing bytes survive a clear.
        assert_eq!(buffer.buffer[TUN_HEADER_OFFSET], 0x45);
    }

    #[tokio::test]
    async fn read_from_fills_at_offset() {
        let payload = ipv4_header([10, 0, 0, 1], [10, 0, 0, 2]);
        let mut buffer = PacketBuffer::new();
        let mut stream: &[u8] = &payload;
        let n = buffer.read_from(&mut stream).await.unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buffer.packet(), &payload[..]);
        assert!(buffer.parse());
    }

    #[tokio::test]
    async fn read_from_empty_stream() {
        let mut buffer = PacketBuffer::new();
        let mut stream: &[u8] = &[];
        assert_eq!(buffer.read_from(&mut stream).await.unwrap(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn pool_round_trip() {
        let pool = PacketPool::new();
        assert_eq!(pool.size(), 0);

        let mut buffer = pool.get();
        buffer.buffer_mut()[TUN_HEADER_OFFSET] = 0x45;
        buffer.set_len(IPV4_HEADER_LEN);
        pool.put(buffer);
        assert_eq!(pool.size(), 1);

        // The recycled buffer comes back clean.
        let buffer = pool.get();
        assert!(buffer.is_empty());
        assert!(buffer.src().is_none());
        assert_eq!(pool.size(), 0);
        pool.put(buffer);
        assert_eq!(pool.size(), 1);
    }
}
