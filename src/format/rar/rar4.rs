//! RAR 1.5-4.x block structure.
//!
//! Every block starts with a seven byte base header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 2 | CRC16 (low half of CRC32 over bytes 2..size) |
//! | 2 | 1 | block type |
//! | 3 | 2 | flags |
//! | 5 | 2 | header size |
//!
//! Blocks with flag `0x8000` carry a 32-bit data size at offset 7; for file
//! blocks that field is the packed size.

use std::io::Write;
use std::time::SystemTime;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use super::{ENCRYPTED_ENTRY, RAR4_SIGNATURE};
use crate::archive_path::normalize_name;
use crate::edit::EntryEdit;
use crate::format::{CompressionMethod, EntryInfo, RewriteSummary, dedupe_edits, decode_legacy_name};
use crate::progress::{ProgressReporter, RewriteTicker};
use crate::timestamp::DosDateTime;
use crate::{Error, Result};

const BLOCK_MAIN: u8 = 0x73;
const BLOCK_FILE: u8 = 0x74;
const BLOCK_END: u8 = 0x7B;

const BASE_HEADER_SIZE: usize = 7;
const MAIN_HEADER_SIZE: u16 = 13;
const FILE_HEADER_FIXED: usize = 32;

/// Main header flags.
const MHD_VOLUME: u16 = 0x0001;
const MHD_SOLID: u16 = 0x0008;
const MHD_PASSWORD: u16 = 0x0080;

/// File header flags.
const LHD_SPLIT_BEFORE: u16 = 0x0001;
const LHD_SPLIT_AFTER: u16 = 0x0002;
const LHD_PASSWORD: u16 = 0x0004;
const LHD_WINDOW_MASK: u16 = 0x00E0;
const LHD_DIRECTORY: u16 = 0x00E0;
const LHD_LARGE: u16 = 0x0100;
const LHD_UNICODE: u16 = 0x0200;
const LONG_BLOCK: u16 = 0x8000;
const EARC_NEXT_VOLUME_ABSENT: u16 = 0x4000;

const METHOD_STORE: u8 = 0x30;
const HOST_WIN32: u8 = 2;
const ATTR_ARCHIVE: u32 = 0x20;
const UNPACK_VERSION: u8 = 20;

/// One block: its span and, for file blocks, the parsed header.
#[derive(Debug)]
pub(crate) struct Block {
    pub offset: usize,
    pub kind: u8,
    pub len: usize,
    pub file: Option<FileHeader>,
}

#[derive(Debug, Clone)]
pub(crate) struct FileHeader {
    pub name: String,
    pub flags: u16,
    pub pack_size: u64,
    pub unp_size: u64,
    pub crc32: u32,
    pub modified: DosDateTime,
    pub method: u8,
    pub data_offset: usize,
}

impl FileHeader {
    pub(crate) fn is_directory(&self) -> bool {
        self.flags & LHD_WINDOW_MASK == LHD_DIRECTORY
    }

    fn is_split(&self) -> bool {
        self.flags & (LHD_SPLIT_BEFORE | LHD_SPLIT_AFTER) != 0
    }

    pub(crate) fn info(&self) -> Option<EntryInfo> {
        let path = normalize_name(&self.name);
        if path.is_empty() {
            return None;
        }
        Some(EntryInfo {
            path,
            raw_name: self.name.clone(),
            size: self.unp_size,
            compressed_size: self.pack_size,
            last_modified: Some(self.modified.to_system_time()),
            is_directory: self.is_directory(),
            method: if self.method == METHOD_STORE {
                CompressionMethod::Stored
            } else {
                CompressionMethod::Other(self.method as u16)
            },
        })
    }
}

/// A parsed RAR 4 archive.
#[derive(Debug)]
pub(crate) struct Rar4Archive {
    /// Offset of the marker block; anything before it is an SFX stub.
    pub marker_offset: usize,
    pub main_flags: u16,
    pub blocks: Vec<Block>,
}

fn header_crc(header: &[u8]) -> u16 {
    (crc32fast::hash(&header[2..]) & 0xFFFF) as u16
}

impl Rar4Archive {
    pub(crate) fn parse(data: &[u8], marker_offset: usize) -> Result<Self> {
        let mut pos = marker_offset + RAR4_SIGNATURE.len();
        let mut blocks = Vec::new();
        let mut main_flags = 0;

        while pos < data.len() {
            let base = data
                .get(pos..pos + BASE_HEADER_SIZE)
                .ok_or_else(|| Error::corrupt(pos as u64, "truncated block header"))?;
            let kind = base[2];
            let flags = LittleEndian::read_u16(&base[3..5]);
            let header_len = LittleEndian::read_u16(&base[5..7]) as usize;
            if header_len < BASE_HEADER_SIZE {
                return Err(Error::corrupt(pos as u64, "block header too small"));
            }
            let header = data
                .get(pos..pos + header_len)
                .ok_or_else(|| Error::corrupt(pos as u64, "truncated block header"))?;
            if LittleEndian::read_u16(&header[0..2]) != header_crc(header) {
                return Err(Error::corrupt(pos as u64, "block header CRC mismatch"));
            }

            let mut file = None;
            let data_len = match kind {
                BLOCK_MAIN => {
                    main_flags = flags;
                    if flags & MHD_PASSWORD != 0 {
                        return Err(Error::UnsupportedFeature {
                            feature: "encrypted RAR headers",
                        });
                    }
                    0
                }
                BLOCK_FILE => {
                    let parsed = parse_file_header(header, pos)?;
                    let len = parsed.pack_size;
                    file = Some(parsed);
                    len
                }
                _ if flags & LONG_BLOCK != 0 && header_len >= 11 => LittleEndian::read_u32(&header[7..11]) as u64,
                _ => 0,
            };

            let len = usize::try_from(data_len)
                .ok()
                .and_then(|d| d.checked_add(header_len))
                .filter(|&len| pos + len <= data.len())
                .ok_or_else(|| Error::corrupt(pos as u64, "block data exceeds archive"))?;
            blocks.push(Block {
                offset: pos,
                kind,
                len,
                file,
            });
            pos += len;
            if kind == BLOCK_END {
                break;
            }
        }

        Ok(Self {
            marker_offset,
            main_flags,
            blocks,
        })
    }

    pub(crate) fn files(&self) -> impl Iterator<Item = &FileHeader> {
        self.blocks.iter().filter_map(|b| b.file.as_ref())
    }

    pub(crate) fn list(&self) -> Vec<EntryInfo> {
        self.files().filter_map(FileHeader::info).collect()
    }

    pub(crate) fn find(&self, path: &str) -> Option<&FileHeader> {
        self.files()
            .find(|f| !f.is_directory() && normalize_name(&f.name) == path)
    }
}

fn parse_file_header(header: &[u8], offset: usize) -> Result<FileHeader> {
    if header.len() < FILE_HEADER_FIXED {
        return Err(Error::corrupt(offset as u64, "file header too small"));
    }
    let flags = LittleEndian::read_u16(&header[3..5]);
    let mut pack_size = LittleEndian::read_u32(&header[7..11]) as u64;
    let mut unp_size = LittleEndian::read_u32(&header[11..15]) as u64;
    let crc32 = LittleEndian::read_u32(&header[16..20]);
    let modified = DosDateTime::from_u32(LittleEndian::read_u32(&header[20..24]));
    let method = header[25];
    let name_len = LittleEndian::read_u16(&header[26..28]) as usize;

    let mut name_start = FILE_HEADER_FIXED;
    if flags & LHD_LARGE != 0 {
        let high = header
            .get(32..40)
            .ok_or_else(|| Error::corrupt(offset as u64, "truncated large file header"))?;
        pack_size |= (LittleEndian::read_u32(&high[0..4]) as u64) << 32;
        unp_size |= (LittleEndian::read_u32(&high[4..8]) as u64) << 32;
        name_start += 8;
    }
    let raw_name = header
        .get(name_start..name_start + name_len)
        .ok_or_else(|| Error::corrupt(offset as u64, "truncated file name"))?;

    Ok(FileHeader {
        name: decode_name(raw_name, flags & LHD_UNICODE != 0),
        flags,
        pack_size,
        unp_size,
        crc32,
        modified,
        method,
        data_offset: offset + header.len(),
    })
}

/// Decodes a RAR 4 file name.
///
/// Unicode names are either plain UTF-8 (no NUL byte) or an ASCII fallback,
/// a NUL, and the RAR 3.x compressed UTF-16 form.
fn decode_name(raw: &[u8], unicode: bool) -> String {
    if !unicode {
        return decode_legacy_name(raw);
    }
    match raw.iter().position(|&b| b == 0) {
        None => String::from_utf8_lossy(raw).into_owned(),
        Some(nul) => {
            let units = decode_compressed_unicode(&raw[..nul], &raw[nul + 1..]);
            String::from_utf16_lossy(&units)
        }
    }
}

fn decode_compressed_unicode(ascii: &[u8], enc: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(ascii.len());
    let Some(&high_byte) = enc.first() else {
        return ascii.iter().map(|&b| b as u16).collect();
    };
    let high = (high_byte as u16) << 8;
    let mut pos = 1;
    let mut flags = 0u8;
    let mut flag_bits = 0u32;

    while pos < enc.len() {
        if flag_bits == 0 {
            flags = enc[pos];
            pos += 1;
            flag_bits = 8;
        }
        flag_bits -= 2;
        match (flags >> flag_bits) & 3 {
            0 => {
                let Some(&b) = enc.get(pos) else { break };
                out.push(b as u16);
                pos += 1;
            }
            1 => {
                let Some(&b) = enc.get(pos) else { break };
                out.push(b as u16 | high);
                pos += 1;
            }
            2 => {
                let (Some(&lo), Some(&hi)) = (enc.get(pos), enc.get(pos + 1)) else {
                    break;
                };
                out.push(lo as u16 | (hi as u16) << 8);
                pos += 2;
            }
            _ => {
                let Some(&len) = enc.get(pos) else { break };
                pos += 1;
                if len & 0x80 != 0 {
                    let Some(&correction) = enc.get(pos) else { break };
                    pos += 1;
                    for _ in 0..(len & 0x7F) as usize + 2 {
                        let Some(&a) = ascii.get(out.len()) else { break };
                        out.push(a.wrapping_add(correction) as u16 | high);
                    }
                } else {
                    for _ in 0..len as usize + 2 {
                        let Some(&a) = ascii.get(out.len()) else { break };
                        out.push(a as u16);
                    }
                }
            }
        }
    }
    out
}

/// Extracts a stored entry, verifying its CRC.
pub(crate) fn extract(data: &[u8], file: &FileHeader, limit: u64) -> Result<Vec<u8>> {
    if file.flags & LHD_PASSWORD != 0 {
        return Err(Error::UnsupportedCompressionMethod {
            method: ENCRYPTED_ENTRY.into(),
        });
    }
    if file.is_split() {
        return Err(Error::UnsupportedFeature {
            feature: "RAR entries split across volumes",
        });
    }
    if file.method != METHOD_STORE {
        return Err(Error::UnsupportedCompressionMethod {
            method: format!("RAR method 0x{:02x}", file.method),
        });
    }
    if file.unp_size > limit {
        return Err(Error::ResourceLimitExceeded(format!(
            "Entry size {} exceeds limit {}",
            file.unp_size, limit
        )));
    }
    if file.pack_size != file.unp_size {
        return Err(Error::corrupt(
            file.data_offset as u64,
            "stored entry with differing packed and unpacked sizes",
        ));
    }
    let out = data[file.data_offset..file.data_offset + file.pack_size as usize].to_vec();
    let crc = crc32fast::hash(&out);
    if crc != file.crc32 {
        return Err(Error::corrupt(
            file.data_offset as u64,
            format!(
                "CRC mismatch for '{}': expected {:08x}, got {:08x}",
                file.name, file.crc32, crc
            ),
        ));
    }
    Ok(out)
}

fn write_main_header(out: &mut dyn Write) -> std::io::Result<()> {
    let mut header = vec![0, 0, BLOCK_MAIN];
    header.write_u16::<LittleEndian>(0)?;
    header.write_u16::<LittleEndian>(MAIN_HEADER_SIZE)?;
    header.write_u16::<LittleEndian>(0)?;
    header.write_u32::<LittleEndian>(0)?;
    write_with_crc(header, out)
}

fn write_end_block(out: &mut dyn Write) -> std::io::Result<()> {
    let mut header = vec![0, 0, BLOCK_END];
    header.write_u16::<LittleEndian>(EARC_NEXT_VOLUME_ABSENT)?;
    header.write_u16::<LittleEndian>(BASE_HEADER_SIZE as u16)?;
    write_with_crc(header, out)
}

fn write_with_crc(mut header: Vec<u8>, out: &mut dyn Write) -> std::io::Result<()> {
    let crc = header_crc(&header);
    header[0..2].copy_from_slice(&crc.to_le_bytes());
    out.write_all(&header)
}

/// Writes a stored file block for `edit`.
fn write_stored_file(edit: &EntryEdit, modified: SystemTime, out: &mut dyn Write) -> Result<u64> {
    let name = edit.path.as_str().replace('/', "\\");
    let size = edit.data.len() as u64;
    let large = size > u32::MAX as u64;

    let mut flags = LONG_BLOCK;
    if !name.is_ascii() {
        flags |= LHD_UNICODE;
    }
    if large {
        flags |= LHD_LARGE;
    }
    let header_len = FILE_HEADER_FIXED + if large { 8 } else { 0 } + name.len();
    let header_len = u16::try_from(header_len).map_err(|_| Error::UnsupportedFeature {
        feature: "RAR file headers over 64 KiB",
    })?;

    let mut header = Vec::with_capacity(header_len as usize);
    header.extend_from_slice(&[0, 0, BLOCK_FILE]);
    header.write_u16::<LittleEndian>(flags)?;
    header.write_u16::<LittleEndian>(header_len)?;
    header.write_u32::<LittleEndian>(size as u32)?;
    header.write_u32::<LittleEndian>(size as u32)?;
    header.push(HOST_WIN32);
    header.write_u32::<LittleEndian>(crc32fast::hash(&edit.data))?;
    header.write_u32::<LittleEndian>(DosDateTime::from_system_time(modified).as_u32())?;
    header.push(UNPACK_VERSION);
    header.push(METHOD_STORE);
    header.write_u16::<LittleEndian>(name.len() as u16)?;
    header.write_u32::<LittleEndian>(ATTR_ARCHIVE)?;
    if large {
        header.write_u32::<LittleEndian>((size >> 32) as u32)?;
        header.write_u32::<LittleEndian>((size >> 32) as u32)?;
    }
    header.extend_from_slice(name.as_bytes());
    write_with_crc(header, out)?;
    out.write_all(&edit.data)?;
    Ok(header_len as u64 + size)
}

/// Rewrites (or creates, when `data` is empty) a RAR 4 archive.
///
/// Existing blocks are copied byte for byte; an edited entry's block is
/// replaced in position by a stored block; new entries go before a fresh
/// end-of-archive block.
pub(crate) fn rewrite(
    data: &[u8],
    archive: Option<&Rar4Archive>,
    edits: &[EntryEdit],
    out: &mut dyn Write,
    progress: &mut dyn ProgressReporter,
) -> Result<RewriteSummary> {
    let edits = dedupe_edits(edits);
    let mut used = vec![false; edits.len()];
    let mut summary = RewriteSummary::default();
    let now = SystemTime::now();

    if let Some(archive) = archive {
        if archive.main_flags & MHD_VOLUME != 0 {
            return Err(Error::UnsupportedFeature {
                feature: "writing multi-volume RAR archives",
            });
        }
    }

    let file_blocks = archive.map_or(0, |a| a.files().count());
    let replaced = edits
        .iter()
        .filter(|e| archive.is_some_and(|a| a.find(e.path.as_str()).is_some()))
        .count();
    let total = file_blocks + edits.len() - replaced;
    let mut ticker = RewriteTicker::new(progress, total as u64);

    match archive {
        None => {
            out.write_all(RAR4_SIGNATURE)?;
            write_main_header(out)?;
            summary.bytes_written += (RAR4_SIGNATURE.len() + MAIN_HEADER_SIZE as usize) as u64;
        }
        Some(archive) => {
            let prefix = &data[..archive.marker_offset + RAR4_SIGNATURE.len()];
            out.write_all(prefix)?;
            summary.bytes_written += prefix.len() as u64;

            for block in &archive.blocks {
                let raw = &data[block.offset..block.offset + block.len];
                let Some(file) = &block.file else {
                    if block.kind != BLOCK_END {
                        out.write_all(raw)?;
                        summary.bytes_written += raw.len() as u64;
                    }
                    continue;
                };

                let path = normalize_name(&file.name);
                let hit = if file.is_directory() {
                    None
                } else {
                    edits.iter().position(|e| e.path.as_str() == path)
                };
                match hit {
                    Some(i) if used[i] => {
                        log::debug!("dropping duplicate RAR entry '{}'", path);
                    }
                    Some(i) => {
                        if archive.main_flags & MHD_SOLID != 0 {
                            return Err(Error::UnsupportedFeature {
                                feature: "replacing entries in solid RAR archives",
                            });
                        }
                        used[i] = true;
                        ticker.begin(&path, edits[i].data.len() as u64)?;
                        summary.bytes_written += write_stored_file(edits[i], now, out)?;
                        summary.entries_replaced += 1;
                        ticker.finish();
                    }
                    None => {
                        ticker.begin(&path, file.unp_size)?;
                        out.write_all(raw)?;
                        summary.bytes_written += raw.len() as u64;
                        summary.entries_kept += 1;
                        ticker.finish();
                    }
                }
            }
        }
    }

    for (edit, used) in edits.iter().zip(used) {
        if used {
            continue;
        }
        ticker.begin(edit.path.as_str(), edit.data.len() as u64)?;
        summary.bytes_written += write_stored_file(edit, now, out)?;
        summary.entries_added += 1;
        ticker.finish();
    }

    write_end_block(out)?;
    summary.bytes_written += BASE_HEADER_SIZE as u64;
    out.flush()?;
    log::debug!(
        "rar rewrite: {} kept, {} replaced, {} added, {} bytes",
        summary.entries_kept,
        summary.entries_replaced,
        summary.entries_added,
        summary.bytes_written
    );
    Ok(summary)
}
