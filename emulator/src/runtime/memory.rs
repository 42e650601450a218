use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::constants::{self as C, Address, Doubleword, Word};

/// Represents errors related to memory manipulations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The address is past the end of installed memory
    #[error("nonexistent address {0:#x}")]
    Nonexistent(Address),

    /// The address is not a multiple of the access size
    #[error("misaligned access at {0:#x}")]
    Misaligned(Address),

    /// The page write lock does not match the key
    #[error("store to {address:#x} denied by write lock {lock} (key {key})")]
    WriteLocked { address: Address, lock: u8, key: u8 },
}

/// Observational access counters of a page
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessCounters {
    pub reads: u64,
    pub writes: u64,
    pub executes: u64,
}

/// Result of an atomic modify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modified {
    /// The value after the modification
    pub result: Word,
    pub carry: bool,
    pub overflow: bool,
}

/// Add `operand` to `value` as `bits`-wide two's-complement numbers
pub(crate) fn add_bits(value: Word, operand: Word, bits: u32) -> Modified {
    let mask = (1u64 << bits) - 1;
    let sign = 1u64 << (bits - 1);
    let a = u64::from(value) & mask;
    let b = u64::from(operand) & mask;
    let sum = a + b;
    let result = sum & mask;

    Modified {
        result: result as Word,
        carry: sum > mask,
        overflow: (a & sign) == (b & sign) && (result & sign) != (a & sign),
    }
}

struct Page {
    bytes: Box<[u8]>,
    lock: u8,
    counters: AccessCounters,
}

impl Page {
    fn new() -> Self {
        Self {
            bytes: vec![0; C::PAGE_BYTES as usize].into_boxed_slice(),
            lock: 0,
            counters: AccessCounters::default(),
        }
    }

    fn read<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut buffer = [0; N];
        buffer.copy_from_slice(&self.bytes[offset..offset + N]);
        buffer
    }

    fn write<const N: usize>(&mut self, offset: usize, value: [u8; N]) {
        self.bytes[offset..offset + N].copy_from_slice(&value);
    }

    fn check_lock(&self, page: usize, address: Address, key: u8) -> Result<(), MemoryError> {
        if page < C::WRITE_LOCK_PAGES && self.lock != 0 && key != 0 && self.lock != key {
            Err(MemoryError::WriteLocked {
                address,
                lock: self.lock,
                key,
            })
        } else {
            Ok(())
        }
    }
}

/// Holds the physical memory of the machine.
///
/// Memory is split in pages of 512 words, each behind its own mutex, so that
/// every access only ever holds a single page lock. Addresses are byte
/// addresses and values are big-endian.
pub struct RealMemory {
    pages: Box<[Mutex<Page>]>,
}

impl std::fmt::Debug for RealMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RealMemory {{ pages: {}, ... }}", self.pages.len())
    }
}

impl Default for RealMemory {
    fn default() -> Self {
        Self::new(C::DEFAULT_PAGES)
    }
}

impl RealMemory {
    /// Allocate zeroed memory, clamped to the addressable page count
    #[must_use]
    pub fn new(pages: usize) -> Self {
        let pages = pages.clamp(1, C::MAX_PAGES);
        Self {
            pages: (0..pages).map(|_| Mutex::new(Page::new())).collect(),
        }
    }

    /// Memory with no pages installed, where every access is nonexistent
    #[must_use]
    pub fn empty() -> Self {
        Self {
            pages: Box::default(),
        }
    }

    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages.len()
    }

    /// Installed memory, in words
    #[must_use]
    pub fn words(&self) -> usize {
        self.pages.len() * C::PAGE_WORDS as usize
    }

    fn page_index(&self, address: Address) -> Result<usize, MemoryError> {
        let index = (address / C::PAGE_BYTES) as usize;
        if index < self.pages.len() {
            Ok(index)
        } else {
            Err(MemoryError::Nonexistent(address))
        }
    }

    fn page(&self, index: usize) -> MutexGuard<'_, Page> {
        // A poisoned page only means another thread panicked mid-access; the bytes stay usable
        self.pages[index]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Lock the page holding `size` bytes at `address`, after range and alignment checks
    fn locate(
        &self,
        address: Address,
        size: Address,
    ) -> Result<(usize, MutexGuard<'_, Page>, usize), MemoryError> {
        if address % size != 0 {
            return Err(MemoryError::Misaligned(address));
        }
        let index = self.page_index(address)?;
        let offset = (address % C::PAGE_BYTES) as usize;
        Ok((index, self.page(index), offset))
    }

    fn load<const N: usize>(&self, address: Address) -> Result<[u8; N], MemoryError> {
        let (_, mut page, offset) = self.locate(address, N as Address)?;
        page.counters.reads += 1;
        Ok(page.read(offset))
    }

    fn store<const N: usize>(
        &self,
        address: Address,
        value: [u8; N],
        key: u8,
    ) -> Result<(), MemoryError> {
        let (index, mut page, offset) = self.locate(address, N as Address)?;
        page.check_lock(index, address, key)?;
        page.counters.writes += 1;
        page.write(offset, value);
        Ok(())
    }

    /// Load a byte
    ///
    /// # Errors
    ///
    /// Fails if the address is past installed memory.
    pub fn load_byte(&self, address: Address) -> Result<u8, MemoryError> {
        self.load::<1>(address).map(|[byte]| byte)
    }

    /// Load a halfword
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned or past installed memory.
    pub fn load_half(&self, address: Address) -> Result<u16, MemoryError> {
        self.load(address).map(u16::from_be_bytes)
    }

    /// Load a word
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned or past installed memory.
    pub fn load_word(&self, address: Address) -> Result<Word, MemoryError> {
        self.load(address).map(Word::from_be_bytes)
    }

    /// Load a doubleword
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned or past installed memory.
    pub fn load_doubleword(&self, address: Address) -> Result<Doubleword, MemoryError> {
        self.load(address).map(Doubleword::from_be_bytes)
    }

    /// Load a word as an instruction fetch
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned or past installed memory.
    pub fn fetch_word(&self, address: Address) -> Result<Word, MemoryError> {
        let (_, mut page, offset) = self.locate(address, C::WORD_BYTES)?;
        page.counters.executes += 1;
        Ok(Word::from_be_bytes(page.read(offset)))
    }

    /// Store a byte, checking the write lock against `key`
    ///
    /// # Errors
    ///
    /// Fails if the address is past installed memory or write-locked.
    pub fn store_byte(&self, address: Address, value: u8, key: u8) -> Result<(), MemoryError> {
        self.store(address, [value], key)
    }

    /// Store a halfword, checking the write lock against `key`
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned, past installed memory or write-locked.
    pub fn store_half(&self, address: Address, value: u16, key: u8) -> Result<(), MemoryError> {
        self.store(address, value.to_be_bytes(), key)
    }

    /// Store a word, checking the write lock against `key`
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned, past installed memory or write-locked.
    pub fn store_word(&self, address: Address, value: Word, key: u8) -> Result<(), MemoryError> {
        self.store(address, value.to_be_bytes(), key)
    }

    /// Store a doubleword, checking the write lock against `key`
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned, past installed memory or write-locked.
    pub fn store_doubleword(
        &self,
        address: Address,
        value: Doubleword,
        key: u8,
    ) -> Result<(), MemoryError> {
        self.store(address, value.to_be_bytes(), key)
    }

    /// Atomically replace the word at `address` with `update(old)`, returning the old value
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned, past installed memory or write-locked.
    /// Nothing is written on failure.
    pub fn update_word(
        &self,
        address: Address,
        key: u8,
        update: impl FnOnce(Word) -> Word,
    ) -> Result<Word, MemoryError> {
        let (index, mut page, offset) = self.locate(address, C::WORD_BYTES)?;
        page.check_lock(index, address, key)?;
        let old = Word::from_be_bytes(page.read(offset));
        page.counters.reads += 1;
        page.counters.writes += 1;
        page.write(offset, update(old).to_be_bytes());
        Ok(old)
    }

    /// Atomically swap the word at `address`, returning the old value
    ///
    /// # Errors
    ///
    /// See [`RealMemory::update_word`].
    pub fn exchange_word(
        &self,
        address: Address,
        value: Word,
        key: u8,
    ) -> Result<Word, MemoryError> {
        self.update_word(address, key, |_| value)
    }

    /// Atomically OR bits into the word at `address`, returning the old value
    ///
    /// # Errors
    ///
    /// See [`RealMemory::update_word`].
    pub fn fetch_or_word(
        &self,
        address: Address,
        bits: Word,
        key: u8,
    ) -> Result<Word, MemoryError> {
        self.update_word(address, key, |old| old | bits)
    }

    /// Atomically add a signed delta to the word at `address`
    ///
    /// # Errors
    ///
    /// See [`RealMemory::update_word`].
    pub fn modify_word(
        &self,
        address: Address,
        delta: i32,
        key: u8,
    ) -> Result<Modified, MemoryError> {
        let old = self.update_word(address, key, |old| old.wrapping_add(delta as Word))?;
        Ok(add_bits(old, delta as Word, 32))
    }

    /// Atomically add a signed delta to the halfword at `address`
    ///
    /// # Errors
    ///
    /// Fails if the address is misaligned, past installed memory or write-locked.
    pub fn modify_half(
        &self,
        address: Address,
        delta: i32,
        key: u8,
    ) -> Result<Modified, MemoryError> {
        let (index, mut page, offset) = self.locate(address, 2)?;
        page.check_lock(index, address, key)?;
        let old = u16::from_be_bytes(page.read(offset));
        let modified = add_bits(Word::from(old), delta as Word, 16);
        page.counters.reads += 1;
        page.counters.writes += 1;
        page.write(offset, (modified.result as u16).to_be_bytes());
        Ok(modified)
    }

    /// Atomically add a signed delta to the byte at `address`
    ///
    /// # Errors
    ///
    /// Fails if the address is past installed memory or write-locked.
    pub fn modify_byte(
        &self,
        address: Address,
        delta: i32,
        key: u8,
    ) -> Result<Modified, MemoryError> {
        let (index, mut page, offset) = self.locate(address, 1)?;
        page.check_lock(index, address, key)?;
        let [old] = page.read(offset);
        let modified = add_bits(Word::from(old), delta as Word, 8);
        page.counters.reads += 1;
        page.counters.writes += 1;
        page.write(offset, [modified.result as u8]);
        Ok(modified)
    }

    /// Copy bytes out of memory, across pages
    ///
    /// # Errors
    ///
    /// Fails if the range runs past installed memory.
    pub fn read_bytes(&self, address: Address, buffer: &mut [u8]) -> Result<(), MemoryError> {
        let mut address = address;
        let mut buffer = buffer;
        while !buffer.is_empty() {
            let index = self.page_index(address)?;
            let offset = (address % C::PAGE_BYTES) as usize;
            let length = buffer.len().min(C::PAGE_BYTES as usize - offset);
            let (head, tail) = buffer.split_at_mut(length);
            head.copy_from_slice(&self.page(index).bytes[offset..offset + length]);
            buffer = tail;
            address += length as Address;
        }
        Ok(())
    }

    /// Copy bytes into memory, across pages, ignoring write locks
    ///
    /// # Errors
    ///
    /// Fails if the range runs past installed memory; pages before the
    /// failing one are written.
    pub fn write_bytes(&self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut address = address;
        let mut bytes = bytes;
        while !bytes.is_empty() {
            let index = self.page_index(address)?;
            let offset = (address % C::PAGE_BYTES) as usize;
            let length = bytes.len().min(C::PAGE_BYTES as usize - offset);
            let (head, tail) = bytes.split_at(length);
            self.page(index).bytes[offset..offset + length].copy_from_slice(head);
            bytes = tail;
            address += length as Address;
        }
        Ok(())
    }

    /// The write lock of a page, 0 for pages without a lock
    #[must_use]
    pub fn lock(&self, page: usize) -> u8 {
        if page < C::WRITE_LOCK_PAGES && page < self.pages.len() {
            self.page(page).lock
        } else {
            0
        }
    }

    /// Check that a store of `size` bytes at `address` under `key` would
    /// succeed, without storing anything
    ///
    /// # Errors
    ///
    /// Fails as the store itself would.
    pub fn check_store(&self, address: Address, size: Address, key: u8) -> Result<(), MemoryError> {
        let (index, page, _) = self.locate(address, size)?;
        page.check_lock(index, address, key)
    }

    /// Set the write lock of a page; pages past the lock table are ignored
    pub fn set_lock(&self, page: usize, lock: u8) {
        if page < C::WRITE_LOCK_PAGES && page < self.pages.len() {
            self.page(page).lock = lock & 0x3;
        }
    }

    /// Program sixteen 2-bit locks from one word, most significant first
    pub fn set_locks(&self, first_page: usize, word: Word) {
        for i in 0..16 {
            let lock = (word >> (30 - 2 * i)) & 0x3;
            self.set_lock((first_page + i as usize) % C::WRITE_LOCK_PAGES, lock as u8);
        }
    }

    #[must_use]
    pub fn counters(&self, page: usize) -> Option<AccessCounters> {
        self.pages.get(page).map(|_| self.page(page).counters)
    }

    /// Zero every page, lock and counter
    pub fn clear(&self) {
        for index in 0..self.pages.len() {
            let mut page = self.page(index);
            page.bytes.fill(0);
            page.lock = 0;
            page.counters = AccessCounters::default();
        }
    }
}
