// SPDX-FileCopyrightText: 2025 Russ Fellows <russ.fellows@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// crates/formats/src/bitpack.rs
//
// One-bit-per-value packing along a single axis, numpy `packbits` layout
// (big-endian bit order, last byte zero-padded).

use anyhow::Result;
use ndarray::{Array, ArrayView, Axis, Dimension, Zip};

/// Number of bytes needed to hold `len` bits.
pub fn packed_len(len: usize) -> usize {
    (len + 7) / 8
}

/// Binarise `input` with `v > 0` and pack 8 values per byte along `axis`.
pub fn pack_bits<A, D>(input: &ArrayView<'_, A, D>, axis: Axis) -> Array<u8, D>
where
    A: Copy + Into<f64> + Sync,
    D: Dimension,
{
    let len = input.len_of(axis);
    let mut dim = input.raw_dim();
    dim[axis.index()] = packed_len(len);
    let mut out = Array::<u8, D>::zeros(dim);

    Zip::from(out.lanes_mut(axis))
        .and(input.lanes(axis))
        .par_for_each(|mut packed, lane| {
            for (i, v) in lane.iter().enumerate() {
                if (*v).into() > 0.0 {
                    packed[i / 8] |= 0x80 >> (i % 8);
                }
            }
        });
    out
}

/// Expand each byte along `axis` into 8 values (MSB first) and keep the first `len`.
pub fn unpack_bits<D>(input: &ArrayView<'_, u8, D>, axis: Axis, len: usize) -> Result<Array<u8, D>>
where
    D: Dimension,
{
    let available = input.len_of(axis) * 8;
    if len > available {
        anyhow::bail!(
            "cannot unpack {} values from {} packed bytes along axis {}",
            len,
            input.len_of(axis),
            axis.index()
        );
    }

    let mut dim = input.raw_dim();
    dim[axis.index()] = len;
    let mut out = Array::<u8, D>::zeros(dim);

    Zip::from(out.lanes_mut(axis))
        .and(input.lanes(axis))
        .par_for_each(|mut bits, packed| {
            for (i, bit) in bits.iter_mut().enumerate() {
                *bit = (packed[i / 8] >> (7 - i % 8)) & 1;
            }
        });
    Ok(out)
}

/// Rows along the last axis that are all ones came from an ambiguous base;
/// they become `1 / width` in every column.
pub fn apply_null_rule<D>(sequence: &mut Array<f32, D>)
where
    D: Dimension,
{
    if sequence.ndim() == 0 {
        return;
    }
    let last = Axis(sequence.ndim() - 1);
    let width = sequence.len_of(last);
    if width == 0 {
        return;
    }
    let fill = 1.0 / width as f32;
    for mut row in sequence.lanes_mut(last) {
        if row.iter().all(|&v| v == 1.0) {
            row.fill(fill);
        }
    }
}
