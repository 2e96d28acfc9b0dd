//! Value-stack API: string operations
//!
//! Concatenation/join with ToString coercion, substring and character
//! access. Character indexing is by codepoint; the per-heap string cache
//! keeps char→byte offset windows so repeated indexed reads of the same
//! string stay cheap.

use eider_core::{StrId, TVal};

use crate::error::Unwind;
use crate::heap::Heap;

impl Heap {
    /// Replace the top `count` cells with their ToString concatenation.
    pub fn concat(&mut self, count: usize) -> Result<(), Unwind> {
        if count > self.get_top() {
            return Err(crate::error::range_error(self, "invalid count"));
        }
        let base = self.get_top() - count;
        let mut out: Vec<u8> = Vec::new();
        for i in 0..count {
            let idx = (base + i) as i32;
            self.to_string(idx)?;
            out.extend_from_slice(self.get_lstring(idx).expect("just coerced"));
        }
        let id = crate::strtab::intern(self, &out);
        self.temp_root(TVal::string(id));
        let bottom = self.thr().valstack_bottom;
        self.truncate_to(bottom + base);
        let r = self.push(TVal::string(id));
        self.untemp_root();
        r
    }

    /// Join the top `count` cells with the separator below them:
    /// `[... sep v1 .. vN] -> [... joined]`.
    pub fn join(&mut self, count: usize) -> Result<(), Unwind> {
        if count + 1 > self.get_top() {
            return Err(crate::error::range_error(self, "invalid count"));
        }
        let sep_idx = (self.get_top() - count - 1) as i32;
        self.to_string(sep_idx)?;
        let sep = self.get_lstring(sep_idx).expect("just coerced").to_vec();

        let base = self.get_top() - count;
        let mut out: Vec<u8> = Vec::new();
        for i in 0..count {
            let idx = (base + i) as i32;
            self.to_string(idx)?;
            if i > 0 {
                out.extend_from_slice(&sep);
            }
            out.extend_from_slice(self.get_lstring(idx).expect("just coerced"));
        }
        let id = crate::strtab::intern(self, &out);
        self.temp_root(TVal::string(id));
        let bottom = self.thr().valstack_bottom;
        self.truncate_to(bottom + base - 1);
        let r = self.push(TVal::string(id));
        self.untemp_root();
        r
    }

    /// Push the codepoint substring `[start, end)` of the string at
    /// `index`. Offsets clamp to the string's length.
    pub fn substring(&mut self, index: i32, start: usize, end: usize) -> Result<(), Unwind> {
        self.to_string(index)?;
        let id = self
            .require_tval(index)?
            .as_string()
            .expect("just coerced");
        let clen = self.hstr(id).clen as usize;
        let start = start.min(clen);
        let end = end.clamp(start, clen);
        let b0 = self.char_to_byte(id, start as u32);
        let b1 = self.char_to_byte(id, end as u32);
        let bytes = self.hstr(id).as_bytes()[b0..b1].to_vec();
        let sub = crate::strtab::intern(self, &bytes);
        self.push(TVal::string(sub))
    }

    /// Codepoint value at character position `pos` of the string at
    /// `index`; NaN-free: out-of-range yields `None`.
    pub fn char_code_at(&mut self, index: i32, pos: u32) -> Result<Option<u32>, Unwind> {
        self.to_string(index)?;
        let id = self
            .require_tval(index)?
            .as_string()
            .expect("just coerced");
        if pos >= self.hstr(id).clen {
            return Ok(None);
        }
        let b = self.char_to_byte(id, pos);
        let bytes = self.hstr(id).as_bytes();
        Ok(Some(decode_codepoint(&bytes[b..])))
    }

    /// Char offset → byte offset with the sliding-window cache: resume
    /// the scan from the cached position when it lies at or before the
    /// requested character.
    pub(crate) fn char_to_byte(&mut self, id: StrId, char_idx: u32) -> usize {
        let (mut cidx, mut bidx) = {
            let mut hit = (0u32, 0u32);
            for e in self.strcache.iter() {
                if e.h == Some(id) && e.cidx <= char_idx && e.cidx >= hit.0 {
                    hit = (e.cidx, e.bidx);
                }
            }
            hit
        };

        let bytes = self.hstr(id).as_bytes();
        while cidx < char_idx {
            let mut b = bidx as usize + 1;
            while b < bytes.len() && bytes[b] & 0xC0 == 0x80 {
                b += 1;
            }
            bidx = b as u32;
            cidx += 1;
        }
        let result = bidx as usize;

        // Rotate the window cache: slot 0 gets the fresh position.
        let slots = self.strcache.len();
        for i in (1..slots).rev() {
            self.strcache[i] = self.strcache[i - 1];
        }
        self.strcache[0] = crate::heap::StrCacheEntry {
            h: Some(id),
            bidx,
            cidx: char_idx,
        };
        result
    }
}

fn decode_codepoint(bytes: &[u8]) -> u32 {
    let b0 = bytes[0];
    if b0 < 0x80 {
        return b0 as u32;
    }
    let (len, init) = if b0 & 0xE0 == 0xC0 {
        (2, (b0 & 0x1F) as u32)
    } else if b0 & 0xF0 == 0xE0 {
        (3, (b0 & 0x0F) as u32)
    } else if b0 & 0xF8 == 0xF0 {
        (4, (b0 & 0x07) as u32)
    } else {
        return b0 as u32; // invalid byte surfaces as-is
    };
    let mut cp = init;
    for i in 1..len {
        match bytes.get(i) {
            Some(&b) if b & 0xC0 == 0x80 => cp = (cp << 6) | (b & 0x3F) as u32,
            _ => return b0 as u32,
        }
    }
    cp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_with_coercion() {
        let mut ctx = Heap::new();
        ctx.push_int(1).unwrap();
        ctx.push_string("x").unwrap();
        ctx.push_true().unwrap();
        ctx.concat(3).unwrap();
        assert_eq!(ctx.get_top(), 1);
        assert_eq!(ctx.get_string(-1), Some("1xtrue"));
    }

    #[test]
    fn test_join_scenario() {
        let mut ctx = Heap::new();
        ctx.push_string(",").unwrap();
        ctx.push_int(1).unwrap();
        ctx.push_string("foo").unwrap();
        ctx.push_object().unwrap();
        ctx.join(3).unwrap();
        assert_eq!(ctx.get_top(), 1);
        assert_eq!(ctx.get_string(-1), Some("1,foo,[object Object]"));
    }

    #[test]
    fn test_join_empty() {
        let mut ctx = Heap::new();
        ctx.push_string("-").unwrap();
        ctx.join(0).unwrap();
        assert_eq!(ctx.get_string(-1), Some(""));
    }

    #[test]
    fn test_substring_unicode() {
        let mut ctx = Heap::new();
        ctx.push_string("aβγd").unwrap();
        ctx.substring(-1, 1, 3).unwrap();
        assert_eq!(ctx.get_string(-1), Some("βγ"));
        ctx.pop().unwrap();
        ctx.substring(-1, 2, 99).unwrap();
        assert_eq!(ctx.get_string(-1), Some("γd"));
    }

    #[test]
    fn test_char_code_at() {
        let mut ctx = Heap::new();
        ctx.push_string("aβc").unwrap();
        assert_eq!(ctx.char_code_at(-1, 0).unwrap(), Some('a' as u32));
        assert_eq!(ctx.char_code_at(-1, 1).unwrap(), Some(0x3B2));
        assert_eq!(ctx.char_code_at(-1, 2).unwrap(), Some('c' as u32));
        assert_eq!(ctx.char_code_at(-1, 3).unwrap(), None);
    }

    #[test]
    fn test_strcache_repeated_access() {
        let mut ctx = Heap::new();
        let long: String = "ホ".repeat(500);
        ctx.push_string(&long).unwrap();
        // Forward scans reuse the cached window.
        for i in (0..500).step_by(7) {
            assert_eq!(ctx.char_code_at(-1, i).unwrap(), Some('ホ' as u32));
        }
        // Backwards access still answers correctly.
        assert_eq!(ctx.char_code_at(-1, 3).unwrap(), Some('ホ' as u32));
    }
}
