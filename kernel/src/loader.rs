//! The application table and exec.
//!
//! Userland binaries are linked into the kernel image; the table maps a
//! name to a raw ELF byte range. `exec` builds a complete replacement
//! address space — lazy, file-backed VMAs per `PT_LOAD`, an empty heap
//! VMA above the highest load segment, the user stack with argv pushed —
//! and only swaps it in once everything has succeeded, so a failed exec
//! leaves the caller untouched.

use core::ptr::NonNull;

use crate::elf::{self, ElfImage, PT_LOAD};
use crate::error::{KernelError, KernelResult};
use crate::memlayout::{is_page_aligned, page_round_up, USTACK_SIZE, USTACK_START};
use crate::mm::page_table::PteFlags;
use crate::mm::uaccess;
use crate::mm::vas::{self, Backing, Vma};
use crate::process::{table, ProcState, Process, MAX_ARG};
use crate::sched;

/// One built-in userland program.
#[derive(Debug, Clone, Copy)]
pub struct UserApp {
    pub name: &'static str,
    pub elf: &'static [u8],
}

/// The applications embedded in this build. The userland build drops its
/// ELFs into `$OXBOW_APPS_DIR` and enables `embedded-apps`; without it
/// the table is empty and `load_init_app` reports the fact at boot.
#[cfg(feature = "embedded-apps")]
macro_rules! app {
    ($name:literal) => {
        UserApp {
            name: $name,
            elf: include_bytes!(concat!(env!("OXBOW_APPS_DIR"), "/", $name, ".elf")),
        }
    };
}

#[cfg(feature = "embedded-apps")]
pub static BUILTIN_APPS: &[UserApp] = &[app!("init"), app!("sh")];

#[cfg(not(feature = "embedded-apps"))]
pub static BUILTIN_APPS: &[UserApp] = &[];

/// Validate every embedded image and print the list. Boot hart only.
pub fn init() {
    crate::println!("applist:");
    for app in BUILTIN_APPS {
        if let Err(e) = ElfImage::parse(app.elf) {
            panic!("invalid elf image for {}: {}", app.name, e);
        }
        crate::println!("\t{}", app.name);
    }
}

pub fn find_app(name: &str) -> Option<&'static UserApp> {
    BUILTIN_APPS.iter().find(|app| app.name == name)
}

struct ExecImage {
    entry: usize,
    sp: usize,
    argc: usize,
    argv_ptr: usize,
    brk_vma: NonNull<Vma>,
    brk: usize,
}

/// Replace `p`'s address space with a fresh one built from `app`.
/// Returns argc (the exec'd program's `a0`). The caller must not hold
/// `p`'s lock. On error the old map is fully preserved.
pub fn exec(p: &'static Process, app: &UserApp, args: &[&[u8]]) -> KernelResult<usize> {
    if args.len() > MAX_ARG {
        return Err(KernelError::InvalidArgument { name: "argc" });
    }
    let image = ElfImage::parse(app.elf)?;

    let new_mm = vas::mm_create(p.trapframe_page).ok_or(KernelError::OutOfMemory)?;

    let built = build_image(new_mm, &image, app, args);
    let info = match built {
        Ok(info) => info,
        Err(e) => {
            vas::mm_free(new_mm);
            return Err(e);
        }
    };

    let old_mm = {
        let mut g = p.inner.lock();
        let old = g.mm.replace(new_mm);
        g.brk_vma = Some(info.brk_vma);
        g.brk = info.brk;
        g.set_name(app.name);
        old
    };

    // SAFETY: this is the current process (or a not-yet-enqueued one);
    // nothing else touches its trapframe.
    let tf = unsafe { p.trapframe() };
    tf.epc = info.entry;
    tf.sp = info.sp;
    tf.a0 = info.argc;
    tf.a1 = info.argv_ptr;

    if let Some(old) = old_mm {
        vas::mm_free(old);
    }

    Ok(info.argc)
}

/// Populate a fresh map from the ELF image and push argv onto the user
/// stack. Everything happens under the new map's lock; the map is private
/// until exec installs it.
fn build_image(
    new_mm: NonNull<vas::Mm>,
    image: &ElfImage<'_>,
    app: &UserApp,
    args: &[&[u8]],
) -> KernelResult<ExecImage> {
    // SAFETY: the fresh map is a live pool object owned by this call.
    let mm_ref = unsafe { new_mm.as_ref() };
    let mut mi = mm_ref.inner.lock();

    let mut max_va_end = 0;
    for i in 0..image.phnum() {
        let ph = image.ph(i)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if !is_page_aligned(ph.p_vaddr) {
            return Err(KernelError::BadElf {
                reason: "p_vaddr not page aligned",
            });
        }

        let vma = vas::create_vma(new_mm).ok_or(KernelError::OutOfMemory)?;
        // SAFETY: the VMA is loose and exclusively ours until mappages.
        unsafe {
            let v = &mut *vma.as_ptr();
            v.vm_start = ph.p_vaddr;
            v.vm_end = page_round_up(ph.p_vaddr + ph.p_memsz);
            v.flags = elf::flags_to_pte(ph.p_flags);
            v.backing = Backing::Image {
                base: app.elf.as_ptr() as usize,
                offset: ph.p_offset,
                filesz: ph.p_filesz,
            };
        }
        if let Err(e) = vas::mm_mappages(&mut mi, vma) {
            vas::free_loose_vma(vma);
            return Err(e);
        }
        max_va_end = max_va_end.max(page_round_up(ph.p_vaddr + ph.p_memsz));
    }

    // The heap starts empty at the page above the highest load segment.
    let brk_vma = vas::create_vma(new_mm).ok_or(KernelError::OutOfMemory)?;
    // SAFETY: as above.
    unsafe {
        let v = &mut *brk_vma.as_ptr();
        v.vm_start = max_va_end;
        v.vm_end = max_va_end;
        v.flags = PteFlags::R | PteFlags::W;
        v.backing = Backing::Zero;
    }
    if let Err(e) = vas::mm_mappages(&mut mi, brk_vma) {
        vas::free_loose_vma(brk_vma);
        return Err(e);
    }

    let ustack = vas::create_vma(new_mm).ok_or(KernelError::OutOfMemory)?;
    // SAFETY: as above.
    unsafe {
        let v = &mut *ustack.as_ptr();
        v.vm_start = USTACK_START - USTACK_SIZE;
        v.vm_end = USTACK_START;
        v.flags = PteFlags::R | PteFlags::W;
        v.backing = Backing::Zero;
    }
    if let Err(e) = vas::mm_mappages(&mut mi, ustack) {
        vas::free_loose_vma(ustack);
        return Err(e);
    }

    // Push the argv strings, each 8-byte aligned.
    let mut sp = USTACK_START;
    let mut uargv = [0usize; MAX_ARG];
    for (i, arg) in args.iter().enumerate() {
        sp -= arg.len() + 1;
        sp &= !7;
        uaccess::copy_to_user(&mut mi, sp, arg)?;
        uaccess::copy_to_user(&mut mi, sp + arg.len(), &[0])?;
        uargv[i] = sp;
    }

    // The pointer array, NULL-terminated, then align sp for the ABI.
    sp -= 8;
    uaccess::copy_to_user(&mut mi, sp, &0usize.to_le_bytes())?;
    for i in (0..args.len()).rev() {
        sp -= 8;
        uaccess::copy_to_user(&mut mi, sp, &uargv[i].to_le_bytes())?;
    }
    let argv_ptr = sp;
    sp &= !15;

    Ok(ExecImage {
        entry: image.entry(),
        sp,
        argc: args.len(),
        argv_ptr,
        brk_vma,
        brk: max_va_end,
    })
}

/// Load the init program into the first process slot and enqueue it.
/// Boot hart only, after the table and pools are up.
pub fn load_init_app() -> KernelResult<()> {
    let app = match find_app("init") {
        Some(app) => app,
        None => panic!("no init in the application table"),
    };

    let (p, g) = table::alloc_proc()?;
    assert_eq!(table::init_proc_index(), Some(p.index));
    // The slot is invisible until it hits the run queue; exec takes the
    // lock itself.
    drop(g);

    exec(p, app, &[b"init"])?;

    let mut g = p.inner.lock();
    g.state = ProcState::Runnable;
    sched::queue::add_task(p.index);
    drop(g);

    log::info!("init loaded, pid 1");
    Ok(())
}
