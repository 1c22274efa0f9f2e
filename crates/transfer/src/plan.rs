use crate::{MAX_PART_COUNT, TransferError};

/// One contiguous byte range of the source file, uploaded as a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    /// 1-based sequence number.
    pub number: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Size of this part in bytes.
    pub size: u64,
}

impl Part {
    /// Offset one past the last byte of this part.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Number of parts needed to cover `file_size` bytes with `part_size` parts.
pub fn part_count(file_size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    file_size.div_ceil(part_size)
}

/// Splits `file_size` bytes into parts of `part_size` bytes.
///
/// Every part except the last is exactly `part_size` bytes; the last part
/// holds the remainder. Empty files cannot be planned: callers send them
/// through the simple upload path instead.
pub fn plan(file_size: u64, part_size: u64) -> Result<Vec<Part>, TransferError> {
    if file_size == 0 {
        return Err(TransferError::InvalidPlan(
            "cannot plan parts for an empty file".into(),
        ));
    }
    if part_size == 0 {
        return Err(TransferError::InvalidPlan("part size must be positive".into()));
    }

    let count = part_count(file_size, part_size);
    if count > MAX_PART_COUNT {
        return Err(TransferError::InvalidPlan(format!(
            "{count} parts exceeds the maximum of {MAX_PART_COUNT}; increase the part size"
        )));
    }

    let mut parts = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut number = 1u32;
    while offset < file_size {
        let size = part_size.min(file_size - offset);
        parts.push(Part {
            number,
            offset,
            size,
        });
        offset += size;
        number += 1;
    }
    Ok(parts)
}
