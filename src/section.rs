//! Loader-supplied section snapshots and address-window clipping.

use crate::config::AddressRange;

/// A contiguous run of bytes mapped at a fixed virtual address.
///
/// Sections borrow their bytes from the loaded file; clipping produces a
/// narrower view and never touches the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section<'b> {
    pub name: String,
    pub virtual_address: u64,
    pub file_offset: u64,
    pub bytes: &'b [u8],
    pub is_executable: bool,
    pub is_data: bool,
}

impl<'b> Section<'b> {
    /// An executable section, as the search engine expects.
    pub fn code(name: impl Into<String>, virtual_address: u64, file_offset: u64, bytes: &'b [u8]) -> Self {
        Self {
            name: name.into(),
            virtual_address,
            file_offset,
            bytes,
            is_executable: true,
            is_data: false,
        }
    }

    /// A non-executable data section (string searches).
    pub fn data(name: impl Into<String>, virtual_address: u64, file_offset: u64, bytes: &'b [u8]) -> Self {
        Self {
            name: name.into(),
            virtual_address,
            file_offset,
            bytes,
            is_executable: false,
            is_data: true,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// One past the last mapped address.
    pub fn end_address(&self) -> u64 {
        self.virtual_address.saturating_add(self.size())
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.virtual_address && addr < self.end_address()
    }

    /// Restrict this section to `range`.
    ///
    /// `None` means unbounded and returns an unchanged copy. Returns `None`
    /// when the window and the section do not overlap or the clipped view
    /// would be empty.
    pub fn clip(&self, range: Option<AddressRange>) -> Option<Section<'b>> {
        let Some(range) = range else {
            return if self.bytes.is_empty() { None } else { Some(self.clone()) };
        };

        let start = self.virtual_address;
        let end = self.end_address();
        if range.end < start || range.start > end {
            return None;
        }

        let mut clipped = self.clone();
        if range.start > start {
            let diff = (range.start - start).min(self.size());
            clipped.virtual_address += diff;
            clipped.file_offset += diff;
            clipped.bytes = &clipped.bytes[diff as usize..];
        }
        if range.end < end {
            let diff = (end - range.end).min(clipped.size());
            let keep = clipped.bytes.len() - diff as usize;
            clipped.bytes = &clipped.bytes[..keep];
        }

        if clipped.bytes.is_empty() {
            return None;
        }
        Some(clipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BYTES: [u8; 0x100] = [0x90; 0x100];

    fn text() -> Section<'static> {
        Section::code(".text", 0x1000, 0x400, &BYTES)
    }

    fn range(start: u64, end: u64) -> Option<AddressRange> {
        Some(AddressRange { start, end })
    }

    #[test]
    fn unbounded_is_identity() {
        let s = text();
        assert_eq!(s.clip(None), Some(s.clone()));
    }

    #[test]
    fn clip_front() {
        let c = text().clip(range(0x1010, 0x2000)).unwrap();
        assert_eq!(c.virtual_address, 0x1010);
        assert_eq!(c.file_offset, 0x410);
        assert_eq!(c.size(), 0xf0);
    }

    #[test]
    fn clip_back() {
        let c = text().clip(range(0x0, 0x1080)).unwrap();
        assert_eq!(c.virtual_address, 0x1000);
        assert_eq!(c.file_offset, 0x400);
        assert_eq!(c.size(), 0x80);
    }

    #[test]
    fn clip_both_ends() {
        let c = text().clip(range(0x1020, 0x1030)).unwrap();
        assert_eq!(c.virtual_address, 0x1020);
        assert_eq!(c.end_address(), 0x1030);
        assert_eq!(c.size() as usize, c.bytes.len());
    }

    #[test]
    fn disjoint_window_is_empty() {
        assert!(text().clip(range(0x2000, 0x3000)).is_none());
        assert!(text().clip(range(0x0, 0x800)).is_none());
    }

    #[test]
    fn touching_window_is_empty() {
        // [0x0, 0x1000) ends right where the section starts.
        assert!(text().clip(range(0x0, 0x1000)).is_none());
        assert!(text().clip(range(0x1100, 0x1200)).is_none());
    }

    #[test]
    fn clipping_is_pure_and_repeatable() {
        let s = text();
        let r = range(0x1040, 0x1080);
        let first = s.clip(r).unwrap();
        let second = s.clip(r).unwrap();
        assert_eq!(first, second);
        assert_eq!(s.virtual_address, 0x1000);
        assert_eq!(s.size(), 0x100);
    }

    #[test]
    fn clipped_stays_inside_original() {
        let s = text();
        for (a, b) in [(0x0, 0x1001), (0x10ff, 0x5000), (0x1001, 0x10fe), (0x0, u64::MAX)] {
            if let Some(c) = s.clip(range(a, b)) {
                assert!(c.virtual_address >= s.virtual_address);
                assert!(c.end_address() <= s.end_address());
            }
        }
    }
}
