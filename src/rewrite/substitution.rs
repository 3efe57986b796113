use bytes::BytesMut;

/// The base URI the upstream speaks and the one clients should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutionPair {
    internal: Vec<u8>,
    external: Vec<u8>,
}

impl SubstitutionPair {
    pub fn new(internal: impl Into<Vec<u8>>, external: impl Into<Vec<u8>>) -> Self {
        Self {
            internal: internal.into(),
            external: external.into(),
        }
    }

    pub fn internal(&self) -> &[u8] {
        &self.internal
    }

    pub fn external(&self) -> &[u8] {
        &self.external
    }

    /// Bytes at the end of an unfinished segment that may still be the start
    /// of an internal base.
    pub fn overlap(&self) -> usize {
        self.internal.len().saturating_sub(1)
    }

    /// Copies `input` into `out`, replacing every non-overlapping occurrence of
    /// the internal base (scanning left to right) with the external base.
    ///
    /// With `hold_tail` set, the last [`overlap`](Self::overlap) bytes after
    /// the final match are left unconsumed. Returns how many input bytes were
    /// consumed.
    pub fn substitute(&self, input: &[u8], out: &mut BytesMut, hold_tail: bool) -> usize {
        if self.internal.is_empty() {
            out.extend_from_slice(input);
            return input.len();
        }

        let mut start = 0;
        while let Some(pos) = find(&input[start..], &self.internal) {
            out.extend_from_slice(&input[start..start + pos]);
            out.extend_from_slice(&self.external);
            start += pos + self.internal.len();
        }

        let end = if hold_tail {
            input.len().saturating_sub(self.overlap()).max(start)
        } else {
            input.len()
        };
        out.extend_from_slice(&input[start..end]);
        end
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pair: &SubstitutionPair, input: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        let consumed = pair.substitute(input, &mut out, false);
        assert_eq!(consumed, input.len());
        out.to_vec()
    }

    #[test]
    fn replaces_every_occurrence() {
        let pair = SubstitutionPair::new(":8090/data/", ":8090/");
        let out = run(&pair, b"<http://:8090/data/s> <http://:8090/data/p> \"x\" .");
        assert_eq!(out, b"<http://:8090/s> <http://:8090/p> \"x\" .");
    }

    #[test]
    fn matches_do_not_overlap() {
        let pair = SubstitutionPair::new("aa", "b");
        assert_eq!(run(&pair, b"aaa"), b"ba");
    }

    #[test]
    fn external_only_input_is_untouched() {
        let pair = SubstitutionPair::new(":8090/data/", ":8090/");
        let input = b"<http://:8090/s> a <http://:8090/o> .";
        assert_eq!(run(&pair, input), input);
    }

    #[test]
    fn empty_internal_base_copies_input() {
        let pair = SubstitutionPair::new("", "x");
        assert_eq!(run(&pair, b"abc"), b"abc");
    }

    #[test]
    fn held_tail_may_be_a_partial_match() {
        let pair = SubstitutionPair::new("abcd", "X");
        let mut out = BytesMut::new();
        let consumed = pair.substitute(b"abcd--ab", &mut out, true);
        assert_eq!(&out[..], b"X-");
        assert_eq!(consumed, 5);
    }
}
