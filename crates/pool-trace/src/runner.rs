//! Replays parsed trace scripts against a freshly initialized system heap.

use std::{
    alloc::{self, Layout},
    collections::BTreeMap,
    fmt::Write as _,
    io,
    ptr::NonNull,
    slice,
};

use pool_alloc::BLOCK_SIZE;
use snafu::{OptionExt as _, ResultExt as _, ensure_whatever, whatever};
use sys_heap::{HeapConfig, HeapReport, SysHeap, SystemMemory as _};

use crate::{
    report::GenericError,
    script::{Command, Line},
};

/// Per-step diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Options {
    /// Dump both pools after every command.
    pub(crate) dump: bool,
    /// Run the integrity walk after every command.
    pub(crate) verify: bool,
}

/// Granule-aligned memory backing the heap's pools.
struct Memory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Memory {
    fn new(size: usize) -> Result<Self, GenericError> {
        ensure_whatever!(size > 0, "heap size must not be zero");
        let layout = Layout::from_size_align(size, BLOCK_SIZE)
            .whatever_context("heap size is not a valid layout")?;
        let ptr = unsafe { alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            whatever!("failed to reserve {size} bytes for the heap");
        };
        Ok(Self { ptr, layout })
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    ptr: NonNull<u8>,
    size: usize,
    /// Leading bytes written by `fill`; only these have known contents.
    filled: usize,
}

impl Allocation {
    fn filled_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.filled) }
    }
}

/// A heap plus the named allocations a script has made in it.
pub(crate) struct Session {
    heap: SysHeap,
    live: BTreeMap<String, Allocation>,
    options: Options,
    // Dropped last: the heap's pools live here.
    _memory: Memory,
}

impl Session {
    pub(crate) fn new(config: HeapConfig, options: Options) -> Result<Self, GenericError> {
        let memory = Memory::new(config.total_size())?;
        let heap = SysHeap::new();
        unsafe { heap.init(config.pool_config(memory.ptr.as_ptr())) }
            .whatever_context("failed to initialize heap")?;
        Ok(Self {
            heap,
            live: BTreeMap::new(),
            options,
            _memory: memory,
        })
    }

    /// Runs every line, stopping at the first failing one.
    pub(crate) fn run<W>(&mut self, lines: &[Line], out: &mut W) -> Result<(), GenericError>
    where
        W: io::Write,
    {
        for line in lines {
            log::trace!("line {}: {}", line.number, line.text);
            self.step(&line.command, out)
                .with_whatever_context(|_| format!("line {}: `{}`", line.number, line.text))?;
        }
        Ok(())
    }

    fn step<W>(&mut self, command: &Command, out: &mut W) -> Result<(), GenericError>
    where
        W: io::Write,
    {
        self.execute(command, out)?;
        if self.options.dump {
            self.dump(out)?;
        }
        if self.options.verify {
            self.heap.verify().whatever_context("heap verification failed")?;
        }
        Ok(())
    }

    fn execute<W>(&mut self, command: &Command, out: &mut W) -> Result<(), GenericError>
    where
        W: io::Write,
    {
        match command {
            Command::Alloc {
                name,
                size,
                align,
                flags,
            } => {
                ensure_whatever!(
                    !self.live.contains_key(name),
                    "`{name}` is already allocated"
                );
                match self.heap.allocate(*size, *align, *flags) {
                    Some(ptr) => {
                        writeln!(out, "{name} = {ptr:p} ({size} bytes)")
                            .whatever_context("failed to write output")?;
                        self.live.insert(
                            name.clone(),
                            Allocation {
                                ptr,
                                size: *size,
                                filled: 0,
                            },
                        );
                    }
                    None => {
                        writeln!(out, "{name} = null").whatever_context("failed to write output")?;
                    }
                }
            }
            Command::Realloc {
                name,
                size,
                align,
                flags,
            } => {
                let entry = self.live.get_mut(name).with_whatever_context(|| {
                    format!("`{name}` is not allocated")
                })?;
                let moved = unsafe {
                    self.heap
                        .reallocate(entry.ptr.as_ptr(), *size, *align, *flags)
                };
                match moved {
                    Some(ptr) => {
                        let how = if ptr == entry.ptr { "in place" } else { "moved" };
                        writeln!(out, "{name} = {ptr:p} ({size} bytes, {how})")
                            .whatever_context("failed to write output")?;
                        *entry = Allocation {
                            ptr,
                            size: *size,
                            filled: entry.filled.min(*size),
                        };
                    }
                    None => {
                        writeln!(out, "{name} unchanged, resize to {size} bytes failed")
                            .whatever_context("failed to write output")?;
                    }
                }
            }
            Command::Free { name } => {
                let entry = self
                    .live
                    .remove(name)
                    .with_whatever_context(|| format!("`{name}` is not allocated"))?;
                unsafe { self.heap.release(entry.ptr.as_ptr()) };
            }
            Command::Fill { name, byte } => {
                let entry = self
                    .live
                    .get_mut(name)
                    .with_whatever_context(|| format!("`{name}` is not allocated"))?;
                unsafe { entry.ptr.as_ptr().write_bytes(*byte, entry.size) };
                entry.filled = entry.size;
            }
            Command::Check { name, byte } => {
                let entry = self.entry(name)?;
                let bytes = entry.filled_bytes();
                if let Some(offset) = bytes.iter().position(|b| b != byte) {
                    let found = bytes[offset];
                    whatever!("`{name}`[{offset}] is {found:#04x}, expected {byte:#04x}");
                }
            }
            Command::Avail { flags } => {
                writeln!(out, "available = {}", self.heap.available(*flags))
                    .whatever_context("failed to write output")?;
            }
            Command::Largest { flags } => {
                writeln!(out, "largest = {}", self.heap.largest_contiguous(*flags))
                    .whatever_context("failed to write output")?;
            }
            Command::Dump => self.dump(out)?,
            Command::Verify => {
                self.heap.verify().whatever_context("heap verification failed")?;
                writeln!(out, "verify ok").whatever_context("failed to write output")?;
            }
        }
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<Allocation, GenericError> {
        self.live
            .get(name)
            .copied()
            .with_whatever_context(|| format!("`{name}` is not allocated"))
    }

    fn dump<W>(&self, out: &mut W) -> Result<(), GenericError>
    where
        W: io::Write,
    {
        let mut text = String::new();
        self.heap
            .dump_to(&mut text)
            .whatever_context("failed to format heap dump")?;
        out.write_all(text.as_bytes())
            .whatever_context("failed to write output")
    }

    /// Reports pool usage and the allocations the script never released.
    pub(crate) fn finish<W>(self, out: &mut W) -> Result<HeapReport, GenericError>
    where
        W: io::Write,
    {
        let report = self
            .heap
            .report()
            .whatever_context("heap is not initialized")?;
        let mut text = format!("{report}\n");
        for (name, entry) in &self.live {
            let _ = writeln!(text, "leaked: {name} ({} bytes at {:p})", entry.size, entry.ptr);
        }
        out.write_all(text.as_bytes())
            .whatever_context("failed to write output")?;
        if !self.live.is_empty() {
            log::warn!("{} allocations were never released", self.live.len());
        }
        Ok(report)
    }
}
