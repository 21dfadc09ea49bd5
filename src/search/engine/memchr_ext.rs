use memchr::*;

pub trait MemchrExt {
    /// All needle occurrences whose absolute address is a multiple of
    /// `align`, where `phase` is the absolute address of byte 0 of the
    /// haystack modulo `align`. Scan windows stitched across chunk
    /// boundaries rarely start aligned, so alignment is judged against
    /// the address, not the buffer offset.
    fn find_aligned_phased(&self, needle: &[u8], align: usize, phase: usize) -> Vec<usize>;

    fn find_aligned(&self, needle: &[u8], align: usize) -> Vec<usize> {
        self.find_aligned_phased(needle, align, 0)
    }
}

impl MemchrExt for [u8] {
    fn find_aligned_phased(&self, needle: &[u8], align: usize, phase: usize) -> Vec<usize> {
        find_aligned_internal(self, needle, align, phase)
    }
}

fn find_aligned_internal(haystack: &[u8], needle: &[u8], align: usize, phase: usize) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return vec![];
    }

    let align = align.max(1);
    let first = needle[0];
    let mut out = Vec::new();

    for pos in memchr_iter(first, haystack) {
        if (phase + pos) % align != 0 {
            continue;
        }
        let end = pos + needle.len();
        if end > haystack.len() {
            continue;
        }
        if &haystack[pos..end] == needle {
            out.push(pos);
        }
    }
    out
}
