//! Chunked, reference-counted byte buffer — the lingua franca between every
//! layer of the stack.
//!
//! The original builds `pktbuf` from blocks carved out of a static slab and
//! links them with an intrusive list; reference counting and block-pool
//! accounting are done by hand. Here a `pktbuf` is an `Rc<RefCell<Inner>>`
//! (see the design note on pointer graphs → ownership in `DESIGN.md`): the
//! `Rc` strong count *is* the reference count, `inc_ref` is `Clone`, and
//! `free` is simply dropping the handle. Block storage comes from the
//! process heap rather than a fixed array, but block-pool and header-pool
//! *admission* is still enforced through [`PktBufPool`] so exhaustion
//! behaves exactly as the spec requires: `alloc` (and any op that must grow
//! the block chain) fails with [`NetError::Mem`] once the configured cap is
//! reached.
//!
//! Structural operations (`add_header`, `remove_header`, `resize`, `join`,
//! `set_cont`) reset the cursor to the head of the buffer; this stays within
//! the required `[0, total_size]` invariant and matches the original's
//! practice of re-seeking after restructuring a buffer.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::NetConfig;
use crate::error::{NetError, NetResult};
use crate::mblock::{MBlock, Timeout};
use crate::tools;

/// Backing admission pool: a budget of block slots and a budget of buffer
/// headers, matching spec.md §4.1/§4.2's "fails when the block pool or the
/// buffer-header pool is exhausted."
pub struct PktBufPool {
    block_size: usize,
    blocks: MBlock<()>,
    headers: MBlock<()>,
}

impl PktBufPool {
    pub fn new(cfg: &NetConfig) -> Arc<PktBufPool> {
        Arc::new(PktBufPool {
            block_size: cfg.pktbuf_block_size,
            blocks: MBlock::new(std::iter::repeat(()).take(cfg.pktbuf_block_count)),
            headers: MBlock::new(std::iter::repeat(()).take(cfg.pktbuf_header_count)),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn take_block(&self) -> NetResult<()> {
        self.blocks.alloc(Timeout::NonBlocking)
    }

    fn give_block(&self) {
        self.blocks.free(());
    }

    fn take_header(&self) -> NetResult<()> {
        self.headers.alloc(Timeout::NonBlocking)
    }

    fn give_header(&self) {
        self.headers.free(());
    }
}

/// One fixed-capacity slot: `storage[data_off .. data_off+len]` is the live
/// payload; the bytes before `data_off` are header-prepend slack.
struct Block {
    storage: Vec<u8>,
    data_off: usize,
    len: usize,
}

impl Block {
    fn new_trailing(cap: usize, len: usize) -> Block {
        // Data positioned at the tail, leaving `cap - len` bytes of slack
        // at the front for later header prepends.
        let mut storage = vec![0u8; cap];
        let data_off = cap - len;
        storage[data_off..].fill(0);
        Block { storage, data_off, len }
    }

    fn new_leading(cap: usize, len: usize) -> Block {
        let storage = vec![0u8; cap];
        Block { storage, data_off: 0, len }
    }

    fn head_slack(&self) -> usize {
        self.data_off
    }

    fn tail_slack(&self) -> usize {
        self.storage.len() - self.data_off - self.len
    }

    fn as_slice(&self) -> &[u8] {
        &self.storage[self.data_off..self.data_off + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.data_off..self.data_off + self.len]
    }
}

#[derive(Clone, Copy, Default)]
struct Cursor {
    block_idx: usize,
    block_off: usize,
    abs_pos: usize,
}

struct Inner {
    pool: Arc<PktBufPool>,
    blocks: VecDeque<Block>,
    total_size: usize,
    cursor: Cursor,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for _ in 0..self.blocks.len() {
            self.pool.give_block();
        }
        self.pool.give_header();
    }
}

impl Inner {
    fn seek(&mut self, offset: usize) -> NetResult<()> {
        if offset > self.total_size {
            return Err(NetError::Param);
        }
        if offset == self.total_size {
            self.cursor = Cursor {
                block_idx: self.blocks.len(),
                block_off: 0,
                abs_pos: offset,
            };
            return Ok(());
        }
        let mut remaining = offset;
        for (idx, blk) in self.blocks.iter().enumerate() {
            if remaining < blk.len {
                self.cursor = Cursor { block_idx: idx, block_off: remaining, abs_pos: offset };
                return Ok(());
            }
            remaining -= blk.len;
        }
        self.cursor = Cursor { block_idx: self.blocks.len(), block_off: 0, abs_pos: offset };
        Ok(())
    }

    fn new_block(&self, len: usize, trailing: bool) -> NetResult<Block> {
        self.pool.take_block()?;
        let cap = self.pool.block_size();
        Ok(if trailing {
            Block::new_trailing(cap, len)
        } else {
            Block::new_leading(cap, len)
        })
    }

    fn drop_block_front(&mut self) {
        self.blocks.pop_front();
        self.pool.give_block();
    }

    fn drop_block_back(&mut self) {
        self.blocks.pop_back();
        self.pool.give_block();
    }
}

/// A chunked, reference-counted byte buffer with a cursor.
///
/// Not `Send`/`Sync` by design: only the protocol worker ever touches a
/// `PktBuf` (see `DESIGN.md`'s note on cross-thread pktbuf ownership).
#[derive(Clone)]
pub struct PktBuf(Rc<RefCell<Inner>>);

impl PktBuf {
    /// Allocates a fresh buffer of exactly `size` bytes, ref count 1. A
    /// `size` of zero yields a single header-only buffer.
    pub fn alloc(pool: &Arc<PktBufPool>, size: usize) -> NetResult<PktBuf> {
        pool.take_header()?;
        let block_size = pool.block_size();
        let mut blocks = VecDeque::new();
        let mut remaining = size;
        let mut first = true;
        loop {
            let chunk = remaining.min(block_size);
            let alloc_result = (|| -> NetResult<Block> {
                pool.take_block()?;
                Ok(if first {
                    Block::new_trailing(block_size, chunk)
                } else {
                    Block::new_leading(block_size, chunk)
                })
            })();
            match alloc_result {
                Ok(blk) => blocks.push_back(blk),
                Err(e) => {
                    for _ in 0..blocks.len() {
                        pool.give_block();
                    }
                    pool.give_header();
                    return Err(e);
                }
            }
            remaining -= chunk;
            first = false;
            if remaining == 0 {
                break;
            }
        }
        let inner = Inner {
            pool: pool.clone(),
            blocks,
            total_size: size,
            cursor: Cursor::default(),
        };
        Ok(PktBuf(Rc::new(RefCell::new(inner))))
    }

    /// Number of outstanding references (including `self`).
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Bumps the reference count; the clone and `self` both refer to the
    /// same buffer.
    pub fn inc_ref(&self) -> PktBuf {
        self.clone()
    }

    /// Drops this handle. Blocks and the header are released back to the
    /// pool only once the last handle is dropped.
    pub fn free(self) {
        drop(self);
    }

    pub fn total_size(&self) -> usize {
        self.0.borrow().total_size
    }

    pub fn seek(&self, offset: usize) -> NetResult<()> {
        self.0.borrow_mut().seek(offset)
    }

    pub fn reset_acc(&self) {
        self.0.borrow_mut().seek(0).expect("0 is always in range");
    }

    pub fn position(&self) -> usize {
        self.0.borrow().cursor.abs_pos
    }

    /// Prepends `size` bytes to the buffer. `cont` requests they land
    /// physically contiguous in the head block (fails with `Size` if
    /// `size` exceeds the block size in that mode).
    pub fn add_header(&self, size: usize, cont: bool) -> NetResult<()> {
        if size == 0 {
            return Ok(());
        }
        let mut inner = self.0.borrow_mut();
        let block_size = inner.pool.block_size();
        if cont && size > block_size {
            return Err(NetError::Size);
        }

        if cont {
            let slack = inner.blocks.front().map(|b| b.head_slack()).unwrap_or(0);
            if slack >= size {
                let front = inner.blocks.front_mut().unwrap();
                front.data_off -= size;
                front.len += size;
            } else {
                let nb = inner.new_block(size, true)?;
                inner.blocks.push_front(nb);
            }
        } else {
            let mut remaining = size;
            let slack = inner.blocks.front().map(|b| b.head_slack()).unwrap_or(0).min(remaining);
            if slack > 0 {
                let front = inner.blocks.front_mut().unwrap();
                front.data_off -= slack;
                front.len += slack;
                remaining -= slack;
            }
            while remaining > 0 {
                let take = remaining.min(block_size);
                let nb = inner.new_block(take, true)?;
                inner.blocks.push_front(nb);
                remaining -= take;
            }
        }
        inner.total_size += size;
        inner.seek(0)?;
        Ok(())
    }

    /// Removes `size` bytes from the front, dropping exhausted head blocks.
    pub fn remove_header(&self, size: usize) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        if size > inner.total_size {
            return Err(NetError::Size);
        }
        let mut remaining = size;
        while remaining > 0 {
            let front_len = inner.blocks.front().map(|b| b.len).unwrap_or(0);
            if front_len == 0 {
                break;
            }
            if remaining >= front_len {
                remaining -= front_len;
                inner.drop_block_front();
            } else {
                let front = inner.blocks.front_mut().unwrap();
                front.data_off += remaining;
                front.len -= remaining;
                remaining = 0;
            }
        }
        inner.total_size -= size;
        inner.seek(0)?;
        Ok(())
    }

    /// Grows (appending blocks) or shrinks (trimming tail bytes/blocks) the
    /// buffer to exactly `new_size`.
    pub fn resize(&self, new_size: usize) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        if new_size > inner.total_size {
            let block_size = inner.pool.block_size();
            let mut grow = new_size - inner.total_size;
            // Fill tail slack of the current last block first.
            if let Some(back) = inner.blocks.back_mut() {
                let room = back.tail_slack().min(grow);
                back.len += room;
                grow -= room;
            }
            while grow > 0 {
                let take = grow.min(block_size);
                let nb = inner.new_block(take, false)?;
                inner.blocks.push_back(nb);
                grow -= take;
            }
            inner.total_size = new_size;
        } else if new_size < inner.total_size {
            let mut shrink = inner.total_size - new_size;
            while shrink > 0 {
                let back_len = inner.blocks.back().map(|b| b.len).unwrap_or(0);
                if back_len == 0 {
                    break;
                }
                if shrink >= back_len {
                    shrink -= back_len;
                    inner.drop_block_back();
                } else {
                    let back = inner.blocks.back_mut().unwrap();
                    back.len -= shrink;
                    shrink = 0;
                }
            }
            inner.total_size = new_size;
        }
        inner.seek(inner.total_size.min(inner.cursor.abs_pos))?;
        Ok(())
    }

    /// Concatenates `src`'s blocks onto the end of `self`; `src` is
    /// consumed. Both buffers must be sole-owned and drawn from the same
    /// pool.
    pub fn join(&self, src: PktBuf) -> NetResult<()> {
        if src.ref_count() != 1 || self.ref_count() != 1 {
            return Err(NetError::State);
        }
        if !Arc::ptr_eq(&self.0.borrow().pool, &src.0.borrow().pool) {
            return Err(NetError::Param);
        }
        let src_inner = Rc::try_unwrap(src.0)
            .map_err(|_| NetError::State)?
            .into_inner();
        // The blocks move over verbatim; ownership of their pool tokens
        // transfers with them, so we must not run `src_inner`'s `Drop`
        // (which would return those tokens to the pool out from under us).
        let mut src_inner = std::mem::ManuallyDrop::new(src_inner);
        let moved_blocks = std::mem::take(&mut src_inner.blocks);
        let moved_size = src_inner.total_size;
        // The header token src_inner would have released on drop still must
        // go back — only the blocks transferred ownership.
        src_inner.pool.give_header();

        let mut inner = self.0.borrow_mut();
        for blk in moved_blocks {
            inner.blocks.push_back(blk);
        }
        inner.total_size += moved_size;
        inner.seek(0)?;
        Ok(())
    }

    /// Ensures the first `size` bytes are physically contiguous in the head
    /// block, shuffling bytes into a fresh block if necessary.
    pub fn set_cont(&self, size: usize) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        if size > inner.total_size {
            return Err(NetError::Size);
        }
        if size == 0 {
            return Ok(());
        }
        if inner.blocks.front().map(|b| b.len).unwrap_or(0) >= size {
            return Ok(());
        }
        let block_size = inner.pool.block_size();
        if size > block_size {
            return Err(NetError::Size);
        }

        // Gather the first `size` bytes across the existing chain.
        let mut gathered = Vec::with_capacity(size);
        let mut need = size;
        for blk in inner.blocks.iter() {
            if need == 0 {
                break;
            }
            let take = need.min(blk.len);
            gathered.extend_from_slice(&blk.as_slice()[..take]);
            need -= take;
        }

        // Drop those bytes from the front of the existing chain.
        let mut remaining = size;
        while remaining > 0 {
            let front_len = inner.blocks.front().map(|b| b.len).unwrap_or(0);
            if remaining >= front_len {
                remaining -= front_len;
                inner.drop_block_front();
            } else {
                let front = inner.blocks.front_mut().unwrap();
                front.data_off += remaining;
                front.len -= remaining;
                remaining = 0;
            }
        }

        let mut nb = inner.new_block(size, true)?;
        nb.as_mut_slice().copy_from_slice(&gathered);
        inner.blocks.push_front(nb);
        inner.seek(0)?;
        Ok(())
    }

    /// Sequential write, advancing the cursor; fails if it would write past
    /// the buffer's current `total_size` (use [`resize`] first to grow).
    pub fn write(&self, src: &[u8]) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        let n = src.len();
        if inner.cursor.abs_pos + n > inner.total_size {
            return Err(NetError::Size);
        }
        let mut written = 0;
        let mut cursor = inner.cursor;
        while written < n {
            let blk = &mut inner.blocks[cursor.block_idx];
            let avail = blk.len - cursor.block_off;
            let take = avail.min(n - written);
            blk.as_mut_slice()[cursor.block_off..cursor.block_off + take]
                .copy_from_slice(&src[written..written + take]);
            written += take;
            cursor.block_off += take;
            cursor.abs_pos += take;
            if cursor.block_off == blk.len && written < n {
                cursor.block_idx += 1;
                cursor.block_off = 0;
            }
        }
        inner.cursor = cursor;
        Ok(())
    }

    /// Sequential read, advancing the cursor.
    pub fn read(&self, dest: &mut [u8]) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        let n = dest.len();
        if inner.cursor.abs_pos + n > inner.total_size {
            return Err(NetError::Size);
        }
        let mut read = 0;
        let mut cursor = inner.cursor;
        while read < n {
            let blk = &inner.blocks[cursor.block_idx];
            let avail = blk.len - cursor.block_off;
            let take = avail.min(n - read);
            dest[read..read + take]
                .copy_from_slice(&blk.as_slice()[cursor.block_off..cursor.block_off + take]);
            read += take;
            cursor.block_off += take;
            cursor.abs_pos += take;
            if cursor.block_off == blk.len && read < n {
                cursor.block_idx += 1;
                cursor.block_off = 0;
            }
        }
        inner.cursor = cursor;
        Ok(())
    }

    /// Copies `n` bytes from `src`'s cursor to `self`'s cursor, advancing
    /// both.
    pub fn copy(&self, src: &PktBuf, n: usize) -> NetResult<()> {
        let mut buf = vec![0u8; n];
        src.read(&mut buf)?;
        self.write(&buf)
    }

    /// Writes `n` copies of `value` at the cursor, advancing it.
    pub fn fill(&self, value: u8, n: usize) -> NetResult<()> {
        let buf = vec![value; n];
        self.write(&buf)
    }

    /// Flattens the entire buffer into one contiguous `Vec<u8>`. Not part
    /// of the original's API (which never needs a fully linear view) but
    /// convenient for higher layers that hand bytes to a driver or to
    /// `tools::checksum16`.
    pub fn to_vec(&self) -> Vec<u8> {
        let inner = self.0.borrow();
        let mut out = Vec::with_capacity(inner.total_size);
        for blk in inner.blocks.iter() {
            out.extend_from_slice(blk.as_slice());
        }
        out
    }

    /// Replaces the buffer's first `data.len()` bytes with `data`,
    /// regardless of cursor position — used by callers building a buffer
    /// from a fully-assembled byte slice (e.g. the netif driver boundary).
    pub fn write_at(&self, offset: usize, data: &[u8]) -> NetResult<()> {
        self.seek(offset)?;
        self.write(data)
    }

    pub fn read_at(&self, offset: usize, n: usize) -> NetResult<Vec<u8>> {
        self.seek(offset)?;
        let mut buf = vec![0u8; n];
        self.read(&mut buf)?;
        Ok(buf)
    }

    /// One's-complement 16-bit checksum over `n` bytes starting at the
    /// cursor; does not move the cursor. Correct across odd starting
    /// offsets and block boundaries because it operates on the gathered
    /// linear byte range rather than per-block.
    pub fn checksum16(&self, n: usize, initial: u32, complement: bool) -> NetResult<u16> {
        let pos = self.position();
        let bytes = self.read_at(pos, n)?;
        self.seek(pos)?;
        Ok(tools::checksum16(&bytes, initial, complement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> Arc<PktBufPool> {
        let mut cfg = NetConfig::default();
        cfg.pktbuf_block_size = 16;
        cfg.pktbuf_block_count = 64;
        cfg.pktbuf_header_count = 16;
        PktBufPool::new(&cfg)
    }

    #[test]
    fn alloc_zero_size_is_header_only() {
        let pool = test_pool();
        let buf = PktBuf::alloc(&pool, 0).unwrap();
        assert_eq!(buf.total_size(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let pool = test_pool();
        let buf = PktBuf::alloc(&pool, 40).unwrap();
        let data: Vec<u8> = (0..40u8).collect();
        buf.write(&data).unwrap();
        buf.seek(0).unwrap();
        let mut out = vec![0u8; 40];
        buf.read(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn add_header_then_remove_header_restores_size() {
        let pool = test_pool();
        let buf = PktBuf::alloc(&pool, 20).unwrap();
        buf.add_header(8, false).unwrap();
        assert_eq!(buf.total_size(), 28);
        buf.remove_header(8).unwrap();
        assert_eq!(buf.total_size(), 20);
    }

    #[test]
    fn add_header_contiguous_fits_in_slack() {
        let pool = test_pool();
        let buf = PktBuf::alloc(&pool, 4).unwrap();
        // block size 16, payload 4 bytes => 12 bytes of front slack.
        buf.add_header(10, true).unwrap();
        assert_eq!(buf.total_size(), 14);
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let pool = test_pool();
        let buf = PktBuf::alloc(&pool, 10).unwrap();
        buf.resize(50).unwrap();
        assert_eq!(buf.total_size(), 50);
        buf.resize(5).unwrap();
        assert_eq!(buf.total_size(), 5);
    }

    #[test]
    fn join_concatenates_and_consumes_src() {
        let pool = test_pool();
        let a = PktBuf::alloc(&pool, 4).unwrap();
        a.write(&[1, 2, 3, 4]).unwrap();
        let b = PktBuf::alloc(&pool, 4).unwrap();
        b.write(&[5, 6, 7, 8]).unwrap();
        a.join(b).unwrap();
        assert_eq!(a.total_size(), 8);
        assert_eq!(a.to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn ref_counting_is_rc_strong_count() {
        let pool = test_pool();
        let a = PktBuf::alloc(&pool, 4).unwrap();
        assert_eq!(a.ref_count(), 1);
        let b = a.inc_ref();
        assert_eq!(a.ref_count(), 2);
        drop(b);
        assert_eq!(a.ref_count(), 1);
    }

    #[test]
    fn pool_exhaustion_fails_alloc() {
        let mut cfg = NetConfig::default();
        cfg.pktbuf_block_size = 8;
        cfg.pktbuf_block_count = 1;
        cfg.pktbuf_header_count = 4;
        let pool = PktBufPool::new(&cfg);
        let _first = PktBuf::alloc(&pool, 8).unwrap();
        assert!(matches!(PktBuf::alloc(&pool, 8), Err(NetError::Mem)));
    }

    #[test]
    fn checksum_matches_tools_checksum16() {
        let pool = test_pool();
        let buf = PktBuf::alloc(&pool, 4).unwrap();
        buf.write(&[0x12, 0x34, 0x56, 0x78]).unwrap();
        buf.seek(0).unwrap();
        let expected = tools::checksum16(&[0x12, 0x34, 0x56, 0x78], 0, false);
        assert_eq!(buf.checksum16(4, 0, false).unwrap(), expected);
    }
}
