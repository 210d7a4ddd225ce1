//! `execve()`: replace the process image.
//!
//! Order of operations, which decides what each failure costs:
//!
//! 1. argv/envp are copied out of user memory into one kernel scratch
//!    block, bounded by `ARG_MAX` (`ENOMEM` past it — the old image is
//!    still intact);
//! 2. the executable chain is resolved *before* teardown: open, execute
//!    permission, and either an ELF `ET_EXEC` header or a `#!` line.
//!    Shebang scripts swap in their interpreter with the POSIX argv
//!    rewrite (argv[0] = interpreter, argv[1] = script path); a second
//!    shebang in the chain is `ELOOP`, an unterminated interpreter line
//!    `ENAMETOOLONG`;
//! 3. the old address space is detached — from here on any failure
//!    terminates the task;
//! 4. a blank image (stack + trampoline) is built, the ELF segments are
//!    loaded, and argv/envp go onto the user stack: argument bytes, the
//!    NULL-terminated argv pointer array, the same for envp, then
//!    `(argc, argv, envp)` with ESP left on argc.
//!
//! Set-uid/set-gid bits of the loaded file replace the effective
//! credentials. Exec resets signal dispositions and closes close-on-exec
//! descriptors.

use super::dispatcher::HandlerResult;
use crate::arch::{TrapFrame, EFLAGS_BASE, EFLAGS_IF};
use crate::memory::userslice::{push_user_bytes, push_user_u32, read_user_cstr, read_user_str_array};
use crate::memory::{MemoryDescriptor, DEFAULT_STACK_SIZE};
use crate::process::{elf, Credentials, Pid, Task};
use crate::vfs::{absolute_path, valid_exec_permission, OpenFile};
use crate::Kernel;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use osmium_abi::limits::{ARG_MAX, PATH_MAX};
use osmium_abi::{Errno, Signal, O_RDONLY};
use osmium_vmem::VirtAddr;

/// Failures before the old image is torn down leave the caller intact;
/// failures after it make the task unrecoverable.
enum ExecError {
    Recoverable(Errno),
    Fatal(Errno),
}

impl From<Errno> for ExecError {
    fn from(errno: Errno) -> Self {
        ExecError::Recoverable(errno)
    }
}

/// SYS_EXECVE (11).
pub fn sys_execve(
    kernel: &Kernel,
    frame: &mut TrapFrame,
    path_ptr: u32,
    argv_ptr: u32,
    envp_ptr: u32,
) -> HandlerResult {
    match do_execve(kernel, frame, path_ptr, argv_ptr, envp_ptr) {
        Ok(()) => {
            // The frame now enters the fresh image with EAX = 0.
            None
        }
        Err(ExecError::Recoverable(errno)) => Some(Err(errno)),
        Err(ExecError::Fatal(errno)) => {
            // The old image is gone and the new one never materialized.
            log::error!("execve failed after teardown ({}); killing task", errno.name());
            {
                let mut sched = kernel.sched.lock();
                let pid = sched.current_pid().expect("execve has a current task");
                sched.exit_task(&kernel.memory, pid, Signal::SIGKILL.as_u32() as i32);
            }
            kernel.schedule(frame);
            None
        }
    }
}

fn do_execve(
    kernel: &Kernel,
    frame: &mut TrapFrame,
    path_ptr: u32,
    argv_ptr: u32,
    envp_ptr: u32,
) -> Result<(), ExecError> {
    let (pid, old_pgd, creds, cwd) = {
        let sched = kernel.sched.lock();
        let task = sched.current_task().ok_or(Errno::NoProcess)?;
        let mm = task.mm.as_ref().ok_or(Errno::NoProcess)?;
        (task.pid, mm.pgd, task.creds, task.cwd.clone())
    };

    // ── Copy path/argv/envp into kernel memory ───────────────────────────
    let (path, mut argv, envp) = {
        let mut mem = kernel.memory.lock();
        let path = read_user_cstr(&mut mem, old_pgd, VirtAddr::new(path_ptr), PATH_MAX)?;
        if argv_ptr == 0 || envp_ptr == 0 {
            return Err(Errno::Fault.into());
        }
        let argv = read_user_str_array(&mut mem, old_pgd, VirtAddr::new(argv_ptr), ARG_MAX)?;
        let envp = read_user_str_array(&mut mem, old_pgd, VirtAddr::new(envp_ptr), ARG_MAX)?;
        (path, argv, envp)
    };
    if argv.is_empty() {
        return Err(Errno::InvalidArgument.into());
    }

    // Scratch budget: string bytes with NULs plus both pointer arrays.
    let scratch = args_block_size(&argv) + args_block_size(&envp);
    if scratch > ARG_MAX {
        return Err(Errno::OutOfMemory.into());
    }

    let path = String::from_utf8(path).map_err(|_| Errno::InvalidArgument)?;
    let exec_path = absolute_path(&cwd, &path);

    // ── Resolve the executable (and a possible interpreter) ──────────────
    let (file, mut creds) = resolve_executable(kernel, &exec_path, &path, creds, &mut argv)?;
    let stat = file.stat().map_err(ExecError::Recoverable)?;
    if stat.is_setuid() {
        creds.uid = stat.uid;
    }
    if stat.is_setgid() {
        creds.gid = stat.gid;
    }

    // ── Point of no return: detach the old image ─────────────────────────
    let old_mm = {
        let mut sched = kernel.sched.lock();
        let task = sched.task_mut(pid).ok_or(ExecError::Fatal(Errno::NoProcess))?;
        task.mm.take()
    };

    let built = build_user_image(kernel, &file, &argv, &envp);
    let (new_mm, entry, sp) = match built {
        Ok(image) => image,
        Err(errno) => {
            if let Some(mm) = old_mm {
                let mut mem = kernel.memory.lock();
                mm.release(&mut mem);
            }
            return Err(ExecError::Fatal(errno));
        }
    };
    let new_pgd = new_mm.pgd;

    // ── Install the new image ────────────────────────────────────────────
    let name = String::from_utf8_lossy(&argv[0]).into_owned();
    {
        let mut sched = kernel.sched.lock();
        let task = sched.task_mut(pid).ok_or(ExecError::Fatal(Errno::NoProcess))?;
        task.mm = Some(new_mm);
        task.name = name;
        task.creds = creds;
        task.sig.reset_actions();
        task.fds.close_cloexec();

        *frame = TrapFrame::new_user();
        frame.eip = entry;
        frame.useresp = sp;
        frame.ebp = sp;
        frame.eflags = EFLAGS_BASE | EFLAGS_IF;
        frame.eax = 0;
        task.frame = *frame;

        sched.force_address_space(new_pgd);
    }

    // The old frames are only dropped after CR3 points at the new image.
    if let Some(mm) = old_mm {
        let mut mem = kernel.memory.lock();
        mm.release(&mut mem);
    }

    log::debug!("execve: pid {} -> {}", pid, exec_path);
    Ok(())
}

/// Open `exec_path` and follow at most one shebang indirection, enforcing
/// execute permission at every step. On a shebang the argv is rewritten
/// POSIX-style in place.
fn resolve_executable(
    kernel: &Kernel,
    exec_path: &str,
    orig_path: &str,
    creds: Credentials,
    argv: &mut Vec<Vec<u8>>,
) -> Result<(Arc<OpenFile>, Credentials), ExecError> {
    let mut current = String::from(exec_path);
    let mut depth = 0u32;

    loop {
        let file = kernel
            .vfs
            .open(&current, O_RDONLY, 0)
            .map_err(ExecError::Recoverable)?;
        let stat = file.stat().map_err(ExecError::Recoverable)?;
        if stat.is_dir() {
            return Err(Errno::AccessDenied.into());
        }
        if !valid_exec_permission(&creds, &stat) {
            return Err(Errno::AccessDenied.into());
        }

        let mut magic = [0u8; 2];
        let n = file.read_at(0, &mut magic).map_err(ExecError::Recoverable)?;
        if n == 2 && magic == *b"#!" {
            // Interpreter scripts may not name another script.
            if depth >= 1 {
                return Err(Errno::InterpreterLoop.into());
            }
            let interpreter = read_shebang_line(&file)?;

            // POSIX argv rewrite: argv[0] is the interpreter, argv[1] the
            // script path as given to exec, the rest shifts right.
            let mut rewritten: Vec<Vec<u8>> =
                Vec::with_capacity(argv.len() + 1);
            rewritten.push(Vec::from(interpreter.as_bytes()));
            rewritten.push(Vec::from(orig_path.as_bytes()));
            rewritten.extend(argv.drain(1..));
            *argv = rewritten;

            current = interpreter;
            depth += 1;
            continue;
        }

        // Must be a loadable ELF; this also rejects truncated files
        // before the old image is torn down.
        elf::read_header(&file).map_err(ExecError::Recoverable)?;
        return Ok((file, creds));
    }
}

/// Parse the interpreter path from a `#!` first line. The line must end
/// in a newline within `PATH_MAX` bytes.
fn read_shebang_line(file: &OpenFile) -> Result<String, ExecError> {
    let mut buf = [0u8; PATH_MAX];
    let n = file.read_at(2, &mut buf).map_err(ExecError::Recoverable)?;
    let line_end = buf[..n]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ExecError::Recoverable(Errno::NameTooLong))?;
    let line = core::str::from_utf8(&buf[..line_end])
        .map_err(|_| ExecError::Recoverable(Errno::ExecFormatError))?
        .trim();
    if line.is_empty() {
        return Err(Errno::ExecFormatError.into());
    }
    Ok(String::from(line))
}

/// Bytes one argument block occupies in the scratch budget: the string
/// bytes with NUL terminators plus the NULL-terminated pointer array.
fn args_block_size(args: &[Vec<u8>]) -> usize {
    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    strings + (args.len() + 1) * core::mem::size_of::<u32>()
}

/// Build a fresh user image: blank address space, ELF segments, argv and
/// envp marshalled onto the stack. Returns `(mm, entry, esp)` with ESP on
/// the `argc` word of the `(argc, argv, envp)` triple.
fn build_user_image(
    kernel: &Kernel,
    file: &OpenFile,
    argv: &[Vec<u8>],
    envp: &[Vec<u8>],
) -> Result<(MemoryDescriptor, u32, u32), Errno> {
    let mut mm = {
        let mut mem = kernel.memory.lock();
        MemoryDescriptor::create_blank(&mut mem, DEFAULT_STACK_SIZE)
            .map_err(|_| Errno::OutOfMemory)?
    };

    let entry = match elf::load_image(&kernel.memory, file, &mut mm) {
        Ok(entry) => entry,
        Err(errno) => {
            let mut mem = kernel.memory.lock();
            mm.release(&mut mem);
            return Err(errno);
        }
    };

    let mut sp = mm.stack_top;
    let stack = (|| -> Result<u32, Errno> {
        let mut mem = kernel.memory.lock();
        let pgd = mm.pgd;

        mm.arg_start = sp;
        let argv_array = push_args(&mut mem, pgd, &mut sp, argv)?;
        mm.arg_end = sp;
        mm.env_start = sp;
        let envp_array = push_args(&mut mem, pgd, &mut sp, envp)?;
        mm.env_end = sp;

        // The `main` calling convention: (argc, argv, envp), ESP on argc.
        push_user_u32(&mut mem, pgd, &mut sp, envp_array)?;
        push_user_u32(&mut mem, pgd, &mut sp, argv_array)?;
        push_user_u32(&mut mem, pgd, &mut sp, argv.len() as u32)?;
        Ok(sp)
    })();

    match stack {
        Ok(sp) => Ok((mm, entry, sp)),
        Err(errno) => {
            let mut mem = kernel.memory.lock();
            mm.release(&mut mem);
            Err(errno)
        }
    }
}

/// Push a NUL-terminated string block and its NULL-terminated pointer
/// array; returns the address of the array.
fn push_args(
    mem: &mut crate::memory::PhysicalMemory,
    pgd: osmium_vmem::Pfn,
    sp: &mut u32,
    args: &[Vec<u8>],
) -> Result<u32, Errno> {
    let mut locations: Vec<u32> = Vec::with_capacity(args.len());
    locations.resize(args.len(), 0);

    for (i, arg) in args.iter().enumerate().rev() {
        push_user_bytes(mem, pgd, sp, &[0u8])?;
        push_user_bytes(mem, pgd, sp, arg)?;
        locations[i] = *sp;
    }
    push_user_u32(mem, pgd, sp, 0)?;
    for &location in locations.iter().rev() {
        push_user_u32(mem, pgd, sp, location)?;
    }
    Ok(*sp)
}

/// Build the init process: pid 1, stdio wired to `/proc/video`, image
/// loaded from `path` with argv `[path]` and an empty environment.
pub fn create_init_process(kernel: &Kernel, path: &str) -> Result<Pid, Errno> {
    let now = kernel.ticks();

    let file = kernel.vfs.open(path, O_RDONLY, 0)?;
    elf::read_header(&file)?;

    let argv = [Vec::from(path.as_bytes())];
    let envp: [Vec<u8>; 0] = [];
    let (mm, entry, sp) = build_user_image(kernel, &file, &argv, &envp)?;

    let mut sched = kernel.sched.lock();
    let pid = sched.alloc_pid().ok_or(Errno::Again)?;
    debug_assert_eq!(pid, crate::process::INIT_PID);

    let mut task = Task::alloc(None, pid, 0, now);
    task.name = String::from(path);
    task.mm = Some(mm);
    task.frame = TrapFrame::new_user();
    task.frame.eip = entry;
    task.frame.useresp = sp;
    task.frame.ebp = sp;
    task.frame.eax = 0;

    // Standard streams on the console device.
    let stdin = kernel.vfs.open("/proc/video", O_RDONLY, 0)?;
    let stdout = kernel.vfs.open("/proc/video", osmium_abi::O_WRONLY, 0)?;
    let stderr = kernel.vfs.open("/proc/video", osmium_abi::O_WRONLY, 0)?;
    task.fds.insert_at(crate::vfs::STDIN, stdin);
    task.fds.insert_at(crate::vfs::STDOUT, stdout);
    task.fds.insert_at(crate::vfs::STDERR, stderr);

    sched.insert_task(task);
    sched.enqueue_task(pid);
    log::info!("init: {} (pid {})", path, pid);
    Ok(pid)
}
