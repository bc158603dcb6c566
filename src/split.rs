//! Command splitting.
//!
//! A data command covering `N` logical blocks on a device limited to `M`
//! blocks per task becomes `ceil(N / M)` tasks. Every task but the last
//! covers exactly `M` blocks, LBAs are contiguous and the buffer is cut in
//! encounter order, splitting a segment where a task boundary falls inside
//! it. A command that fits in one task reuses its buffer as is.

use std::collections::TryReserveError;

use tracing::debug;

use crate::model::{CommandKind, DataBuffer, DataDirection, Task};

/// Result type for split operations.
pub type Result<T> = std::result::Result<T, SplitError>;

/// Errors that abort a split. The command is refused before any task exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Split needs {needed} tasks, limit is {limit}")]
    TooManyTasks { needed: u64, limit: usize },
}

impl From<TryReserveError> for SplitError {
    fn from(err: TryReserveError) -> Self {
        SplitError::ResourceExhausted(err.to_string())
    }
}

/// The transfer a command asks for.
#[derive(Debug, Clone, Copy)]
pub struct SplitRequest {
    pub lba: u64,
    pub sectors: u64,
    pub data_length: usize,
    pub direction: DataDirection,
    pub kind: CommandKind,
}

/// Device limits that bound each task.
#[derive(Debug, Clone, Copy)]
pub struct SplitLimits {
    pub block_size: u32,
    pub max_sectors: u32,
    pub max_tasks: usize,
}

/// Number of tasks a data transfer of `sectors` blocks needs.
pub fn task_count(sectors: u64, max_sectors: u32) -> u64 {
    sectors.div_ceil(u64::from(max_sectors.max(1)))
}

/// Build the task list for one command.
pub fn split(
    request: &SplitRequest,
    buffer: &DataBuffer,
    limits: &SplitLimits,
) -> Result<Vec<Task>> {
    match request.kind {
        CommandKind::Control => Ok(split_control(request, buffer)),
        CommandKind::Data => split_data(request, buffer, limits),
    }
}

/// Control commands never split: one task if they move data or address a
/// block range, none otherwise.
fn split_control(request: &SplitRequest, buffer: &DataBuffer) -> Vec<Task> {
    if request.data_length == 0 && request.sectors == 0 {
        return Vec::new();
    }
    vec![Task {
        index: 0,
        lba: request.lba,
        sectors: request.sectors,
        byte_offset: 0,
        byte_len: request.data_length,
        direction: request.direction,
        buffer: buffer.clone(),
    }]
}

fn split_data(
    request: &SplitRequest,
    buffer: &DataBuffer,
    limits: &SplitLimits,
) -> Result<Vec<Task>> {
    if request.sectors == 0 {
        return Ok(Vec::new());
    }

    let count = task_count(request.sectors, limits.max_sectors);
    if count > limits.max_tasks as u64 {
        return Err(SplitError::TooManyTasks {
            needed: count,
            limit: limits.max_tasks,
        });
    }

    if count == 1 {
        return Ok(vec![Task {
            index: 0,
            lba: request.lba,
            sectors: request.sectors,
            byte_offset: 0,
            byte_len: request.data_length,
            direction: request.direction,
            buffer: buffer.clone(),
        }]);
    }

    let mut tasks = Vec::new();
    tasks.try_reserve_exact(count as usize)?;

    let block_size = limits.block_size as usize;
    let max = u64::from(limits.max_sectors);
    let mut lba = request.lba;
    let mut sectors_left = request.sectors;
    let mut byte_offset = 0usize;

    while sectors_left > 0 {
        let sectors = sectors_left.min(max);
        let byte_len = (sectors as usize * block_size).min(request.data_length - byte_offset);
        let slice = buffer.slice(byte_offset, byte_len)?;
        tasks.push(Task {
            index: tasks.len(),
            lba,
            sectors,
            byte_offset,
            byte_len,
            direction: request.direction,
            buffer: slice,
        });
        lba += sectors;
        sectors_left -= sectors;
        byte_offset += byte_len;
    }

    debug!(
        lba = request.lba,
        sectors = request.sectors,
        tasks = tasks.len(),
        "Split data command"
    );
    Ok(tasks)
}
