use crate::OutputMode;

/// The per-function code buffer.
///
/// The tee-local peephole patches previously written positions, so the
/// buffer exposes a write cursor and random-access patching. Patches are
/// always same-width: in binary mode a single opcode byte, in text mode
/// the equal-length `local.set`/`local.tee` mnemonics. Bytes scheduled
/// for removal are overwritten with NOPs (0x01) and filtered out in one
/// linear sweep at the end.
#[derive(Debug)]
pub(crate) struct CodeBuffer {
    bytes: Vec<u8>,
    mode: OutputMode,
    nop_runs: Vec<(usize, usize)>,
}

impl CodeBuffer {
    pub(crate) fn new(mode: OutputMode) -> Self {
        Self {
            bytes: Vec::new(),
            mode,
            nop_runs: Vec::new(),
        }
    }

    pub(crate) fn mode(&self) -> OutputMode {
        self.mode
    }

    pub(crate) fn is_binary(&self) -> bool {
        self.mode == OutputMode::Wasm
    }

    /// Current write position.
    pub(crate) fn tell(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub(crate) fn push_byte(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Append text output. Only meaningful in text mode.
    pub(crate) fn push_str(&mut self, text: &str) {
        self.bytes.extend_from_slice(text.as_bytes());
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Rewrite a previously emitted `local.set` into `local.tee` in
    /// place. The patch never widens the buffer.
    pub(crate) fn patch_set_to_tee(&mut self, offset: u32) {
        let offset = offset as usize;
        match self.mode {
            OutputMode::Wasm => {
                debug_assert_eq!(self.bytes[offset], 0x21);
                self.bytes[offset] = 0x22;
            }
            OutputMode::Wast => {
                debug_assert_eq!(&self.bytes[offset..offset + 9], b"local.set");
                self.bytes[offset..offset + 9].copy_from_slice(b"local.tee");
            }
        }
    }

    /// Overwrite `len` bytes at `offset` with NOPs and schedule them for
    /// removal by [`CodeBuffer::filter_nops`].
    pub(crate) fn mark_nop_run(&mut self, offset: u32, len: u32) {
        let offset = offset as usize;
        let len = len as usize;
        for byte in &mut self.bytes[offset..offset + len] {
            *byte = 0x01;
        }
        self.nop_runs.push((offset, len));
    }

    /// Replace the opcode byte at `offset` without touching immediates.
    pub(crate) fn patch_byte(&mut self, offset: u32, byte: u8) {
        self.bytes[offset as usize] = byte;
    }

    /// Drop every scheduled NOP run in one linear sweep. Offsets recorded
    /// before the sweep stay meaningful because patching never happens
    /// after filtering.
    pub(crate) fn filter_nops(&mut self) {
        if self.nop_runs.is_empty() {
            return;
        }
        self.nop_runs.sort_unstable();
        let mut out = Vec::with_capacity(self.bytes.len());
        let mut runs = self.nop_runs.iter().peekable();
        let mut index = 0;
        while index < self.bytes.len() {
            if let Some(&&(start, len)) = runs.peek() {
                if start == index {
                    runs.next();
                    index += len;
                    continue;
                }
            }
            out.push(self.bytes[index]);
            index += 1;
        }
        self.bytes = out;
        self.nop_runs.clear();
    }
}
