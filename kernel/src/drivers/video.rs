//! VGA text console.
//!
//! Characters are appended at the cursor; the screen scrolls when the
//! cursor leaves the last row. Insert mode (shifting the remainder of the
//! row right before writing) exists for explicit terminal insert
//! sequences only — it is never the default write path.
//!
//! The backing store is an ordinary cell matrix, so the console works
//! hosted; on bare metal every change is mirrored into the VGA buffer at
//! `0xB8000` and the hardware cursor follows.

use crate::klib::RingBuffer;
use crate::sync::SpinLock;
use core::fmt;

pub const COLS: usize = 80;
pub const ROWS: usize = 25;

/// White-on-black attribute byte.
#[allow(dead_code)]
const ATTR: u8 = 0x07;

pub struct TextConsole {
    cells: [[u8; COLS]; ROWS],
    row: usize,
    col: usize,
    insert_mode: bool,
    /// Line input fed by the keyboard IRQ, drained by `/proc/video`.
    input: RingBuffer<256>,
}

impl TextConsole {
    pub const fn new() -> Self {
        TextConsole {
            cells: [[b' '; COLS]; ROWS],
            row: 0,
            col: 0,
            insert_mode: false,
            input: RingBuffer::new(),
        }
    }

    pub fn set_insert_mode(&mut self, enabled: bool) {
        self.insert_mode = enabled;
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
        self.sync_cursor();
    }

    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            0x08 => {
                // Backspace: retreat and blank the cell.
                if self.col > 0 {
                    self.col -= 1;
                    self.put(self.row, self.col, b' ');
                }
            }
            _ => {
                if self.insert_mode {
                    // Shift the remainder of the row right; the last cell
                    // falls off.
                    for col in (self.col + 1..COLS).rev() {
                        let c = self.cells[self.row][col - 1];
                        self.put(self.row, col, c);
                    }
                }
                self.put(self.row, self.col, byte);
                self.col += 1;
                if self.col == COLS {
                    self.newline();
                }
            }
        }
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < ROWS {
            self.row += 1;
            return;
        }
        // Scroll one row up.
        for row in 1..ROWS {
            self.cells[row - 1] = self.cells[row];
        }
        self.cells[ROWS - 1] = [b' '; COLS];
        self.mirror_all();
    }

    fn put(&mut self, row: usize, col: usize, byte: u8) {
        self.cells[row][col] = byte;
        self.mirror_cell(row, col);
    }

    /// Text of one row, trailing blanks trimmed. Used by `/proc` and the
    /// test suite.
    pub fn row_text(&self, row: usize) -> alloc::string::String {
        let mut s = alloc::string::String::new();
        for &b in &self.cells[row] {
            s.push(b as char);
        }
        alloc::string::String::from(s.trim_end())
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    // ── Keyboard input ───────────────────────────────────────────────────

    pub fn push_input(&mut self, byte: u8) {
        self.input.push(byte);
    }

    pub fn read_input(&mut self, buf: &mut [u8]) -> usize {
        self.input.pop_into(buf)
    }

    // ── Hardware mirroring ───────────────────────────────────────────────

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn mirror_cell(&self, row: usize, col: usize) {
        let cell = ((ATTR as u16) << 8) | self.cells[row][col] as u16;
        // SAFETY: the VGA text buffer is identity-mapped at boot.
        unsafe {
            *(0xB8000 as *mut u16).add(row * COLS + col) = cell;
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn mirror_cell(&self, _row: usize, _col: usize) {}

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn mirror_all(&self) {
        for row in 0..ROWS {
            for col in 0..COLS {
                self.mirror_cell(row, col);
            }
        }
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn mirror_all(&self) {}

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    fn sync_cursor(&self) {
        use crate::arch::x86::outb;
        let pos = (self.row * COLS + self.col) as u16;
        outb(0x3D4, 0x0F);
        outb(0x3D5, (pos & 0xFF) as u8);
        outb(0x3D4, 0x0E);
        outb(0x3D5, (pos >> 8) as u8);
    }

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    fn sync_cursor(&self) {}
}

impl fmt::Write for TextConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

static CONSOLE: SpinLock<TextConsole> = SpinLock::new(TextConsole::new());

/// The global console.
pub fn console() -> &'static SpinLock<TextConsole> {
    &CONSOLE
}

/// Keyboard IRQ: deliver the raw byte to the foreground (current) task's
/// keyboard queue and to the console input. Scan-code decoding is left to
/// user space. Allocation-free, as every ISR must be.
pub fn keyboard_interrupt(_kernel: &crate::Kernel) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let byte = crate::arch::x86::inb(0x60);
        let mut sched = _kernel.sched.lock();
        if let Some(task) = sched.current_task_mut() {
            task.keyboard.push(byte);
        }
        drop(sched);
        CONSOLE.lock().push_input(byte);
    }
}

/// Lock-free console writer for the panic path.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub struct PanicConsole {
    offset: usize,
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
impl fmt::Write for PanicConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if b == b'\n' {
                self.offset = (self.offset / COLS + 1) * COLS;
            } else {
                let cell = ((ATTR as u16) << 8) | b as u16;
                // SAFETY: bounded write into the VGA buffer.
                unsafe {
                    *(0xB8000 as *mut u16).add(self.offset % (COLS * ROWS)) = cell;
                }
                self.offset += 1;
            }
        }
        Ok(())
    }
}

/// Console for the panic handler: writes straight to the VGA buffer,
/// bypassing the lock the panicking context may hold.
///
/// # Safety
/// Only callable when no other context will run again (interrupts off,
/// panic path).
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn console_for_panic() -> PanicConsole {
    PanicConsole { offset: 0 }
}
