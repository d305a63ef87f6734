// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::atomic::{
    AtomicU32,
    Ordering,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Execution buffer backing one command packet.
///
/// The buffer is a flat array of 32-bit words: word 0 is the packet header,
/// the remaining words are the payload. It is shared between submitting
/// threads and a scheduler without locks; ordering is carried by the header
/// word alone. A producer fills the payload first and publishes it by
/// storing the header, a consumer loads the header before reading payload
/// words.
pub struct ExecBuf {
    /// Packet words, header at index 0.
    words: Box<[AtomicU32]>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Associated Functions for Execution Buffers
impl ExecBuf {
    /// Allocates a zeroed execution buffer with `capacity` words.
    pub fn new(capacity: usize) -> Self {
        let mut words: Vec<AtomicU32> = Vec::with_capacity(capacity);
        words.resize_with(capacity, || AtomicU32::new(0));
        Self {
            words: words.into_boxed_slice(),
        }
    }

    /// Returns the capacity of the buffer in words.
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Reads the payload word at `idx`.
    pub fn read(&self, idx: usize) -> u32 {
        self.words[idx].load(Ordering::Relaxed)
    }

    /// Writes the payload word at `idx`.
    pub fn write(&self, idx: usize, value: u32) {
        self.words[idx].store(value, Ordering::Relaxed);
    }

    /// Reads the packet header, acquiring all payload writes published with it.
    pub fn read_header(&self) -> u32 {
        self.words[0].load(Ordering::Acquire)
    }

    /// Writes the packet header, publishing all payload writes made before it.
    pub fn write_header(&self, header: u32) {
        self.words[0].store(header, Ordering::Release);
    }

    /// Copies `words` into the buffer starting at word `offset`.
    pub fn write_words(&self, offset: usize, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.write(offset + i, *word);
        }
    }

    /// Copies `len` words starting at word `offset` out of the buffer.
    pub fn read_words(&self, offset: usize, len: usize) -> Vec<u32> {
        (offset..offset + len).map(|idx| self.read(idx)).collect()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
