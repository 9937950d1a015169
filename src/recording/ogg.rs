//! Minimal Ogg encapsulation for mono Opus streams.
//!
//! The recording pipeline writes one Opus packet per Ogg page, mirroring
//! what RTP delivered. Granule positions count 48 kHz samples; a final page
//! may carry a granule beyond the last packet to pad the stream with
//! trailing silence on decode.

use std::io::Write;

/// Per-page packet flags.
pub const PAGE_FLAG_CONTINUED: u8 = 0x01;
pub const PAGE_FLAG_BOS: u8 = 0x02;
pub const PAGE_FLAG_EOS: u8 = 0x04;

/// 48 kHz samples in one 20 ms Opus frame.
pub const SAMPLES_PER_FRAME: u64 = 960;

pub struct OggOpusWriter<W: Write> {
    writer: W,
    serial: u32,
    page_seq: u32,
    headers_written: bool,
}

impl<W: Write> OggOpusWriter<W> {
    pub fn new(writer: W, serial: u32) -> Self {
        Self {
            writer,
            serial,
            page_seq: 0,
            headers_written: false,
        }
    }

    /// Write the OpusHead and OpusTags header pages.
    pub fn write_headers(&mut self) -> std::io::Result<()> {
        let head = opus_head();
        self.write_page(&head, 0, PAGE_FLAG_BOS)?;
        let tags = opus_tags();
        self.write_page(&tags, 0, 0)?;
        self.headers_written = true;
        Ok(())
    }

    /// Write one Opus packet on its own page ending at `granule`.
    pub fn write_packet(&mut self, payload: &[u8], granule: u64, eos: bool) -> std::io::Result<()> {
        debug_assert!(self.headers_written, "headers must be written first");
        let flags = if eos { PAGE_FLAG_EOS } else { 0 };
        self.write_page(payload, granule, flags)
    }

    /// Close the stream with an empty EOS page at `granule`. Used to extend
    /// the stream duration past the last packet.
    pub fn finish(&mut self, granule: u64) -> std::io::Result<()> {
        self.write_page(&[], granule, PAGE_FLAG_EOS)?;
        self.writer.flush()
    }

    fn write_page(&mut self, packet: &[u8], granule: u64, flags: u8) -> std::io::Result<()> {
        let lacing = lacing_values(packet.len());
        let mut page = Vec::with_capacity(27 + lacing.len() + packet.len());
        page.extend_from_slice(b"OggS");
        page.push(0); // stream structure version
        page.push(flags);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&self.serial.to_le_bytes());
        page.extend_from_slice(&self.page_seq.to_le_bytes());
        page.extend_from_slice(&[0u8; 4]); // crc placeholder
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(packet);

        let crc = ogg_crc(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());

        self.page_seq += 1;
        self.writer.write_all(&page)
    }
}

/// Segment-table lacing values for one packet.
fn lacing_values(len: usize) -> Vec<u8> {
    let mut lacing = Vec::with_capacity(len / 255 + 1);
    let mut remaining = len;
    loop {
        if remaining >= 255 {
            lacing.push(255);
            remaining -= 255;
        } else {
            lacing.push(remaining as u8);
            break;
        }
    }
    lacing
}

/// OpusHead identification packet: version 1, mono, no pre-skip, 48 kHz
/// original rate, zero gain, RTP channel mapping.
fn opus_head() -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(1); // channel count
    head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&0u16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let vendor = b"astra-voice";
    let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4);
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes()); // comment count
    tags
}

// ── Ogg CRC32 ──────────────────────────────────────────────────────
// Polynomial 0x04C11DB7, zero initial value, no reflection, no final xor.

fn crc_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut r = (i as u32) << 24;
            for _ in 0..8 {
                r = if r & 0x8000_0000 != 0 {
                    (r << 1) ^ 0x04C1_1DB7
                } else {
                    r << 1
                };
            }
            *entry = r;
        }
        table
    })
}

pub fn ogg_crc(data: &[u8]) -> u32 {
    let table = crc_table();
    let mut crc = 0u32;
    for &byte in data {
        crc = (crc << 8) ^ table[(((crc >> 24) as u8) ^ byte) as usize];
    }
    crc
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-by-bit reference implementation, independent of the table.
    fn crc_reference(data: &[u8]) -> u32 {
        let mut crc = 0u32;
        for &byte in data {
            crc ^= (byte as u32) << 24;
            for _ in 0..8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ 0x04C1_1DB7
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    #[test]
    fn crc_matches_reference_implementation() {
        for data in [&b""[..], b"OggS", b"astra-voice", &[0xFFu8; 300]] {
            assert_eq!(ogg_crc(data), crc_reference(data));
        }
    }

    #[test]
    fn lacing_small_packet() {
        assert_eq!(lacing_values(0), vec![0]);
        assert_eq!(lacing_values(10), vec![10]);
        assert_eq!(lacing_values(254), vec![254]);
    }

    #[test]
    fn lacing_boundary_and_large_packets() {
        // Exactly 255 needs a zero terminator segment.
        assert_eq!(lacing_values(255), vec![255, 0]);
        assert_eq!(lacing_values(300), vec![255, 45]);
        assert_eq!(lacing_values(510), vec![255, 255, 0]);
    }

    #[test]
    fn opus_head_layout() {
        let head = opus_head();
        assert_eq!(head.len(), 19);
        assert_eq!(&head[..8], b"OpusHead");
        assert_eq!(head[8], 1); // version
        assert_eq!(head[9], 1); // mono
        assert_eq!(u32::from_le_bytes(head[12..16].try_into().unwrap()), 48_000);
    }

    fn parse_pages(data: &[u8]) -> Vec<(u8, u64, u32, Vec<u8>)> {
        let mut pages = Vec::new();
        let mut i = 0;
        while i < data.len() {
            assert_eq!(&data[i..i + 4], b"OggS", "page magic at {i}");
            let flags = data[i + 5];
            let granule = u64::from_le_bytes(data[i + 6..i + 14].try_into().unwrap());
            let seq = u32::from_le_bytes(data[i + 18..i + 22].try_into().unwrap());
            let crc = u32::from_le_bytes(data[i + 22..i + 26].try_into().unwrap());
            let n_segments = data[i + 26] as usize;
            let body_len: usize = data[i + 27..i + 27 + n_segments]
                .iter()
                .map(|&b| b as usize)
                .sum();
            let header_len = 27 + n_segments;
            let body = data[i + header_len..i + header_len + body_len].to_vec();

            // Verify the page CRC with the field zeroed.
            let mut check = data[i..i + header_len + body_len].to_vec();
            check[22..26].fill(0);
            assert_eq!(ogg_crc(&check), crc, "page crc at {i}");

            pages.push((flags, granule, seq, body));
            i += header_len + body_len;
        }
        pages
    }

    #[test]
    fn stream_structure_is_valid() {
        let mut out = Vec::new();
        {
            let mut writer = OggOpusWriter::new(&mut out, 0xA5A5_0001);
            writer.write_headers().unwrap();
            writer.write_packet(&[1, 2, 3], 960, false).unwrap();
            writer.write_packet(&[4, 5, 6], 1920, false).unwrap();
            writer.finish(48_000 * 4).unwrap();
        }

        let pages = parse_pages(&out);
        assert_eq!(pages.len(), 5);
        assert_eq!(pages[0].0, PAGE_FLAG_BOS);
        assert_eq!(&pages[0].3[..8], b"OpusHead");
        assert_eq!(&pages[1].3[..8], b"OpusTags");
        assert_eq!(pages[2].3, vec![1, 2, 3]);
        assert_eq!(pages[2].1, 960);
        // Page sequence numbers are contiguous from zero.
        for (n, page) in pages.iter().enumerate() {
            assert_eq!(page.2, n as u32);
        }
        // Final page: empty, EOS, with the padded duration granule.
        let last = pages.last().unwrap();
        assert_eq!(last.0, PAGE_FLAG_EOS);
        assert_eq!(last.1, 48_000 * 4);
        assert!(last.3.is_empty());
    }
}
