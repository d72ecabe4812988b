// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// crates/formats/src/lib.rs
//
pub mod bitpack;
pub mod hdf5;

pub use bitpack::{apply_null_rule, pack_bits, packed_len, unpack_bits};
pub use hdf5::{SequenceH5Reader, SequenceH5Writer};

/// Default name of the sequences dataset.
pub const SEQUENCES_KEY: &str = "sequences";
/// Default name of the targets dataset.
pub const TARGETS_KEY: &str = "targets";

/// Name of the scalar record holding the unpadded length for `key`.
pub fn length_key(key: &str) -> String {
    format!("{}_length", key)
}

/// Shape of the four-dataset layout, fixed when the file is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutShape {
    /// Total number of rows (batch_size * n_steps)
    pub rows: usize,
    /// True sequence length before packing
    pub sequence_length: usize,
    /// Alphabet width (4 for DNA)
    pub alphabet: usize,
    /// True number of labels before packing
    pub targets_length: usize,
    pub packed: bool,
}

impl LayoutShape {
    /// Stored shape of the `sequences` dataset.
    pub fn sequences_dims(&self) -> [usize; 3] {
        let len = if self.packed {
            packed_len(self.sequence_length)
        } else {
            self.sequence_length
        };
        [self.rows, len, self.alphabet]
    }

    /// Stored shape of the `targets` dataset.
    pub fn targets_dims(&self) -> [usize; 2] {
        let len = if self.packed {
            packed_len(self.targets_length)
        } else {
            self.targets_length
        };
        [self.rows, len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_layout_rounds_up_to_bytes() {
        let shape = LayoutShape {
            rows: 12,
            sequence_length: 1000,
            alphabet: 4,
            targets_length: 919,
            packed: true,
        };
        assert_eq!(shape.sequences_dims(), [12, 125, 4]);
        assert_eq!(shape.targets_dims(), [12, 115]);
    }

    #[test]
    fn dense_layout_keeps_lengths() {
        let shape = LayoutShape {
            rows: 3,
            sequence_length: 10,
            alphabet: 4,
            targets_length: 5,
            packed: false,
        };
        assert_eq!(shape.sequences_dims(), [3, 10, 4]);
        assert_eq!(shape.targets_dims(), [3, 5]);
        assert_eq!(length_key("sequences"), "sequences_length");
    }
}
