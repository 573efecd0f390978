//! Linear-memory protocol of the guest ABI.
//!
//! Every import receives a stack pointer and reads its arguments from
//! fixed offsets in the guest stack frame; strings and slices are
//! `(ptr i64, len i64)` pairs. The argv/env block is written at a fixed
//! offset before the `run` export is invoked: NUL-terminated strings,
//! 8-aligned, followed by a pointer vector of 64-bit entries — the argv
//! pointers, a zero, the sorted `key=value` environment, a zero.

use wasmer::MemoryView;

use crate::RunnerError;

/// Where the argv/env block starts.
const ARGS_OFFSET: u64 = 4096;
/// The guest's data segments start here; the block must stay below it.
const MIN_DATA_ADDR: u64 = 4096 + 8192;

pub(crate) fn addr(sp: i32, offset: u64) -> u64 {
    sp as u32 as u64 + offset
}

pub(crate) fn get_u8(view: &MemoryView, at: u64) -> Result<u8, RunnerError> {
    Ok(view.read_u8(at)?)
}

pub(crate) fn set_u8(view: &MemoryView, at: u64, value: u8) -> Result<(), RunnerError> {
    Ok(view.write_u8(at, value)?)
}

pub(crate) fn get_i32(view: &MemoryView, at: u64) -> Result<i32, RunnerError> {
    let mut buf = [0u8; 4];
    view.read(at, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn get_u32(view: &MemoryView, at: u64) -> Result<u32, RunnerError> {
    let mut buf = [0u8; 4];
    view.read(at, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn set_i32(view: &MemoryView, at: u64, value: i32) -> Result<(), RunnerError> {
    Ok(view.write(at, &value.to_le_bytes())?)
}

pub(crate) fn get_i64(view: &MemoryView, at: u64) -> Result<i64, RunnerError> {
    let mut buf = [0u8; 8];
    view.read(at, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn set_i64(view: &MemoryView, at: u64, value: i64) -> Result<(), RunnerError> {
    Ok(view.write(at, &value.to_le_bytes())?)
}

pub(crate) fn get_u64(view: &MemoryView, at: u64) -> Result<u64, RunnerError> {
    let mut buf = [0u8; 8];
    view.read(at, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn set_u64(view: &MemoryView, at: u64, value: u64) -> Result<(), RunnerError> {
    Ok(view.write(at, &value.to_le_bytes())?)
}

/// Read the `(ptr, len)` slice descriptor at `at` and copy the bytes out.
pub(crate) fn load_bytes(view: &MemoryView, at: u64) -> Result<Vec<u8>, RunnerError> {
    let ptr = get_i64(view, at)? as u64;
    let len = get_i64(view, at + 8)? as usize;
    let mut buf = vec![0u8; len];
    view.read(ptr, &mut buf)?;
    Ok(buf)
}

/// The slice descriptor itself, without copying.
pub(crate) fn load_slice_desc(view: &MemoryView, at: u64) -> Result<(u64, u64), RunnerError> {
    let ptr = get_i64(view, at)? as u64;
    let len = get_i64(view, at + 8)? as u64;
    Ok((ptr, len))
}

pub(crate) fn load_string(view: &MemoryView, at: u64) -> Result<String, RunnerError> {
    let bytes = load_bytes(view, at)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Lay out argv and the environment, returning `(argc, argv_ptr)` for the
/// `run` export.
pub(crate) fn write_args_block(
    view: &MemoryView,
    argv: &[String],
    env: &std::collections::BTreeMap<String, String>,
) -> Result<(i32, i32), RunnerError> {
    let mut offset = ARGS_OFFSET;

    let mut write_string = |offset: &mut u64, s: &str| -> Result<u64, RunnerError> {
        let ptr = *offset;
        view.write(*offset, s.as_bytes())?;
        view.write_u8(*offset + s.len() as u64, 0)?;
        *offset += s.len() as u64 + 1;
        if *offset % 8 != 0 {
            *offset += 8 - *offset % 8;
        }
        Ok(ptr)
    };

    let argc = argv.len() as i32;
    let mut pointers = Vec::with_capacity(argv.len() + env.len() + 2);
    for arg in argv {
        pointers.push(write_string(&mut offset, arg)?);
    }
    pointers.push(0);
    // BTreeMap iteration is already sorted by key
    for (key, value) in env {
        pointers.push(write_string(&mut offset, &format!("{key}={value}"))?);
    }
    pointers.push(0);

    let argv_ptr = offset as i32;
    for pointer in pointers {
        set_u64(view, offset, pointer)?;
        offset += 8;
    }

    if offset >= MIN_DATA_ADDR {
        return Err(RunnerError::ArgsTooLarge);
    }
    Ok((argc, argv_ptr))
}
