use std::{ffi::OsStr, mem, os::unix::ffi::OsStrExt};

const HEADER_LEN: usize = mem::size_of::<libc::inotify_event>();

/// An `inotify_event` as laid out in the read buffer. The move cookie is
/// skipped.
#[derive(Debug, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub wd: i32,
    pub mask: u32,
    pub name: Option<&'a OsStr>,
}

/// Walks the records packed into one `read(2)` on an inotify descriptor.
///
/// Records have no separator: each header declares the length of the name
/// that follows it, and the name is NUL padded up to that length. A record
/// whose declared length runs past the end of the window ends the walk.
pub struct RecordIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> RecordIter<'a> {
    pub fn new(buf: &'a [u8]) -> RecordIter<'a> {
        RecordIter { buf, offset: 0 }
    }
}

fn word(bytes: &[u8], at: usize) -> Option<[u8; 4]> {
    bytes.get(at..at + 4)?.try_into().ok()
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = RawRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buf.get(self.offset..)?;
        if rest.len() < HEADER_LEN {
            self.offset = self.buf.len();
            return None;
        }

        let wd = i32::from_ne_bytes(word(rest, 0)?);
        let mask = u32::from_ne_bytes(word(rest, 4)?);
        let name_len = u32::from_ne_bytes(word(rest, 12)?) as usize;

        let Some(padded) = HEADER_LEN
            .checked_add(name_len)
            .and_then(|end| rest.get(HEADER_LEN..end))
        else {
            self.offset = self.buf.len();
            return None;
        };

        let trimmed = match padded.iter().position(|b| *b == 0) {
            Some(nul) => &padded[..nul],
            None => padded,
        };

        self.offset += HEADER_LEN + name_len;

        Some(RawRecord {
            wd,
            mask,
            name: (!trimmed.is_empty()).then(|| OsStr::from_bytes(trimmed)),
        })
    }
}
