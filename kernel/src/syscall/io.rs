//! File I/O syscalls: open, close, read, write.

use super::dispatcher::HandlerResult;
use crate::memory::userslice::{copy_from_user, copy_to_user, read_user_cstr};
use crate::vfs::absolute_path;
use crate::Kernel;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use osmium_abi::limits::PATH_MAX;
use osmium_abi::{Errno, O_CLOEXEC};
use osmium_vmem::{Pfn, VirtAddr};

/// Cap of one kernel-buffered transfer chunk.
const IO_CHUNK: usize = 4096;

/// SYS_OPEN (5).
pub fn sys_open(kernel: &Kernel, path_ptr: u32, flags: u32, mode: u32) -> HandlerResult {
    Some(do_open(kernel, path_ptr, flags, mode))
}

fn do_open(kernel: &Kernel, path_ptr: u32, flags: u32, mode: u32) -> Result<u32, Errno> {
    let (pid, pgd, cwd) = current_context(kernel)?;

    let raw = {
        let mut mem = kernel.memory.lock();
        read_user_cstr(&mut mem, pgd, VirtAddr::new(path_ptr), PATH_MAX)?
    };
    let path = String::from_utf8(raw).map_err(|_| Errno::InvalidArgument)?;
    let absolute = absolute_path(&cwd, &path);

    let file = kernel.vfs.open(&absolute, flags, mode as u16)?;

    let mut sched = kernel.sched.lock();
    let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
    task.fds
        .insert_with_flags(file, flags & O_CLOEXEC != 0)
}

/// SYS_CLOSE (6).
pub fn sys_close(kernel: &Kernel, fd: u32) -> HandlerResult {
    let mut sched = kernel.sched.lock();
    let Some(task) = sched.current_task_mut() else {
        return Some(Err(Errno::NoProcess));
    };
    Some(task.fds.close(fd).map(|()| 0))
}

/// SYS_READ (3).
pub fn sys_read(kernel: &Kernel, fd: u32, buf_ptr: u32, count: u32) -> HandlerResult {
    Some(do_read(kernel, fd, buf_ptr, count))
}

fn do_read(kernel: &Kernel, fd: u32, buf_ptr: u32, count: u32) -> Result<u32, Errno> {
    let (pid, pgd, _) = current_context(kernel)?;
    let file = get_file(kernel, pid, fd)?;

    // Terminal reads drain the caller's keyboard queue first; the console
    // backend only sees what no task consumed.
    let stat = file.stat()?;
    if stat.mode & osmium_abi::S_IFMT == osmium_abi::S_IFCHR {
        let mut line = [0u8; IO_CHUNK];
        let wanted = (count as usize).min(IO_CHUNK);
        let n = {
            let mut sched = kernel.sched.lock();
            let task = sched.task_mut(pid).ok_or(Errno::NoProcess)?;
            task.keyboard.pop_into(&mut line[..wanted])
        };
        if n > 0 {
            let mut mem = kernel.memory.lock();
            copy_to_user(&mut mem, pgd, VirtAddr::new(buf_ptr), &line[..n])?;
            return Ok(n as u32);
        }
    }

    let mut scratch = vec![0u8; IO_CHUNK];
    let mut done = 0u32;
    while done < count {
        let chunk = ((count - done) as usize).min(IO_CHUNK);
        let n = file.read(&mut scratch[..chunk])?;
        if n == 0 {
            break;
        }
        let mut mem = kernel.memory.lock();
        copy_to_user(&mut mem, pgd, VirtAddr::new(buf_ptr + done), &scratch[..n])?;
        done += n as u32;
        if n < chunk {
            break;
        }
    }
    Ok(done)
}

/// SYS_WRITE (4).
pub fn sys_write(kernel: &Kernel, fd: u32, buf_ptr: u32, count: u32) -> HandlerResult {
    Some(do_write(kernel, fd, buf_ptr, count))
}

fn do_write(kernel: &Kernel, fd: u32, buf_ptr: u32, count: u32) -> Result<u32, Errno> {
    let (pid, pgd, _) = current_context(kernel)?;
    let file = get_file(kernel, pid, fd)?;

    let mut scratch = vec![0u8; IO_CHUNK];
    let mut done = 0u32;
    while done < count {
        let chunk = ((count - done) as usize).min(IO_CHUNK);
        {
            let mut mem = kernel.memory.lock();
            copy_from_user(
                &mut mem,
                pgd,
                VirtAddr::new(buf_ptr + done),
                &mut scratch[..chunk],
            )?;
        }
        let n = file.write(&scratch[..chunk])?;
        done += n as u32;
        if n < chunk {
            break;
        }
    }
    Ok(done)
}

fn get_file(kernel: &Kernel, pid: u32, fd: u32) -> Result<Arc<crate::vfs::OpenFile>, Errno> {
    let sched = kernel.sched.lock();
    let task = sched.task(pid).ok_or(Errno::NoProcess)?;
    Ok(task.fds.get(fd)?.clone())
}

fn current_context(kernel: &Kernel) -> Result<(u32, Pfn, String), Errno> {
    let sched = kernel.sched.lock();
    let task = sched.current_task().ok_or(Errno::NoProcess)?;
    let mm = task.mm.as_ref().ok_or(Errno::NoProcess)?;
    Ok((task.pid, mm.pgd, task.cwd.clone()))
}

#[cfg(test)]
mod tests {
    use crate::selftest::{boot_with_init, peek_user, scratch_base, syscall};
    use crate::vfs::STDIN;
    use osmium_abi::Sysno;

    #[test]
    fn terminal_read_drains_the_task_keyboard_queue() {
        let (kernel, mut frame) = boot_with_init();
        {
            let mut sched = kernel.sched.lock();
            let task = sched.current_task_mut().unwrap();
            for &b in b"ls\n" {
                task.keyboard.push(b);
            }
        }

        let buf_at = scratch_base(kernel);
        syscall(kernel, &mut frame, Sysno::Read, &[STDIN, buf_at, 16]);
        assert_eq!(frame.eax, 3);
        let mut out = [0u8; 3];
        peek_user(kernel, buf_at, &mut out);
        assert_eq!(&out, b"ls\n");

        // Queue drained: the next read falls through to the console
        // backend, which is empty.
        syscall(kernel, &mut frame, Sysno::Read, &[STDIN, buf_at, 16]);
        assert_eq!(frame.eax, 0);
    }
}
