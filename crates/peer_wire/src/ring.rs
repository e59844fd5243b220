use failure::Fail;

#[derive(Debug, Fail)]
#[fail(
    display = "ring buffer overflow: requested {} bytes, {} available",
    requested, available
)]
pub struct OverflowError {
    pub requested: usize,
    pub available: usize,
}

/// A zero-copy(-ish) ring buffer used to reassemble length-prefixed peer
/// wire frames out of arbitrarily-fragmented socket reads (spec.md §4.8).
///
/// Two equally-sized primary buffers (`buf0`, `buf1`) take turns being
/// "main". Data logically occupies `[data_start, data_end)` measured from
/// the start of whichever buffer is main; once `data_start` advances past
/// `cap`, every byte in main has been consumed and the roles swap. A
/// request that straddles the main/side boundary is served out of a
/// scratch "cross" buffer instead of forcing the caller to special-case
/// wraparound.
pub struct RingBuffer {
    buf0: Vec<u8>,
    buf1: Vec<u8>,
    cross_read: Vec<u8>,
    cross_write: Vec<u8>,
    cap: usize,
    main_is_buf0: bool,
    data_start: usize,
    data_end: usize,
    cross_write_pending: Option<usize>,
}

impl RingBuffer {
    /// `cap` should be at least as large as the largest frame the caller
    /// expects to read or write in one shot.
    pub fn with_capacity(cap: usize) -> RingBuffer {
        RingBuffer {
            buf0: vec![0u8; cap],
            buf1: vec![0u8; cap],
            cross_read: vec![0u8; cap],
            cross_write: vec![0u8; cap],
            cap,
            main_is_buf0: true,
            data_start: 0,
            data_end: 0,
            cross_write_pending: None,
        }
    }

    pub fn data_size(&self) -> usize {
        self.data_end - self.data_start
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    fn main(&self) -> &Vec<u8> {
        if self.main_is_buf0 {
            &self.buf0
        } else {
            &self.buf1
        }
    }

    fn main_mut(&mut self) -> &mut Vec<u8> {
        if self.main_is_buf0 {
            &mut self.buf0
        } else {
            &mut self.buf1
        }
    }

    fn side_mut(&mut self) -> &mut Vec<u8> {
        if self.main_is_buf0 {
            &mut self.buf1
        } else {
            &mut self.buf0
        }
    }

    fn side(&self) -> &Vec<u8> {
        if self.main_is_buf0 {
            &self.buf1
        } else {
            &self.buf0
        }
    }

    /// Returns a contiguous writable span of length `n`. The caller must
    /// fill it and call `appended(n)` before requesting another span.
    pub fn use_for_append(&mut self, n: usize) -> Result<&mut [u8], OverflowError> {
        let available = 2 * self.cap - self.data_end;
        if n > available {
            return Err(OverflowError {
                requested: n,
                available,
            });
        }

        if self.data_end + n <= self.cap {
            let start = self.data_end;
            return Ok(&mut self.main_mut()[start..start + n]);
        }

        if self.data_end >= self.cap {
            let start = self.data_end - self.cap;
            return Ok(&mut self.side_mut()[start..start + n]);
        }

        // Straddles the main tail and the side head.
        self.cross_write_pending = Some(n);
        Ok(&mut self.cross_write[0..n])
    }

    /// Confirms `n` bytes were written into the span last returned by
    /// `use_for_append`.
    pub fn appended(&mut self, n: usize) {
        if let Some(pending) = self.cross_write_pending.take() {
            debug_assert_eq!(pending, n);
            let tail_len = self.cap - self.data_end;
            let (tail, head) = self.cross_write[..n].split_at(tail_len);
            let tail = tail.to_vec();
            let head = head.to_vec();
            let data_end = self.data_end;
            let cap = self.cap;
            self.main_mut()[data_end..cap].copy_from_slice(&tail);
            self.side_mut()[0..head.len()].copy_from_slice(&head);
        }
        self.data_end += n;
    }

    /// Returns a readable contiguous span of length `n` starting at
    /// `data_start`.
    pub fn use_data(&mut self, n: usize) -> Result<&[u8], OverflowError> {
        if n > self.data_size() {
            return Err(OverflowError {
                requested: n,
                available: self.data_size(),
            });
        }

        if self.data_start + n <= self.cap {
            let start = self.data_start;
            return Ok(&self.main()[start..start + n]);
        }

        if self.data_start >= self.cap {
            let start = self.data_start - self.cap;
            return Ok(&self.side()[start..start + n]);
        }

        let tail_len = self.cap - self.data_start;
        let head_len = n - tail_len;
        let tail = self.main()[self.data_start..self.cap].to_vec();
        let head = self.side()[0..head_len].to_vec();
        self.cross_read[0..tail_len].copy_from_slice(&tail);
        self.cross_read[tail_len..n].copy_from_slice(&head);
        Ok(&self.cross_read[0..n])
    }

    /// Advances `data_start` by `n`, swapping main/side if it crosses the
    /// current main's boundary.
    pub fn skip_data(&mut self, n: usize) {
        self.data_start += n;
        while self.data_start >= self.cap {
            self.main_is_buf0 = !self.main_is_buf0;
            self.data_start -= self.cap;
            self.data_end -= self.cap;
        }
    }

    /// `use_data(n)` followed by a copy into `dst` and `skip_data(n)`.
    pub fn pop_data(&mut self, dst: &mut [u8], n: usize) -> Result<(), OverflowError> {
        let data = self.use_data(n)?;
        dst[..n].copy_from_slice(data);
        self.skip_data(n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(buf: &mut RingBuffer, data: &[u8]) {
        let span = buf.use_for_append(data.len()).unwrap();
        span.copy_from_slice(data);
        buf.appended(data.len());
    }

    #[test]
    fn append_then_pop_round_trips() {
        let mut buf = RingBuffer::with_capacity(1024);
        append(&mut buf, b"hello world");
        let mut out = vec![0u8; 11];
        buf.pop_data(&mut out, 11).unwrap();
        assert_eq!(&out, b"hello world");
        assert_eq!(buf.data_size(), 0);
    }

    #[test]
    fn conservation_after_append_and_pop() {
        let mut buf = RingBuffer::with_capacity(1024);
        append(&mut buf, &vec![7u8; 200]);
        let before = buf.data_size();
        let mut out = vec![0u8; 200];
        buf.pop_data(&mut out, 200).unwrap();
        append(&mut buf, &vec![9u8; 200]);
        assert_eq!(buf.data_size(), before);
    }

    #[test]
    fn straddling_append_and_read() {
        let mut buf = RingBuffer::with_capacity(1024);
        append(&mut buf, &vec![1u8; 700]);
        let mut sink = vec![0u8; 700];
        buf.pop_data(&mut sink, 700).unwrap(); // swaps main/side.

        let payload: Vec<u8> = (0..900u32).map(|i| (i % 256) as u8).collect();
        append(&mut buf, &payload); // straddles the new main's tail.

        let data = buf.use_data(900).unwrap();
        assert_eq!(data, payload.as_slice());
    }

    #[test]
    fn overflow_is_rejected() {
        let mut buf = RingBuffer::with_capacity(16);
        assert!(buf.use_for_append(40).is_err());
    }

    #[test]
    fn reading_more_than_available_is_rejected() {
        let mut buf = RingBuffer::with_capacity(64);
        append(&mut buf, b"short");
        assert!(buf.use_data(100).is_err());
    }
}
