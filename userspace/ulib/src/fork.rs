/*
 * Copy-On-Write Fork
 *
 * fork() clones the current environment without copying any page contents
 * up front. Every writable (or already-COW) page is re-mapped into both the
 * child and the parent read-only with the COW software bit; the first write
 * on either side faults into the handler below, which copies just that page.
 * The parent re-map is what makes parent writes fault too.
 *
 * The one page that must never be shared is the user exception stack: the
 * child gets a fresh one, since the COW machinery itself runs on it.
 */

use crate::env::{init_thisenv, ENV_RUNNABLE};
use crate::layout::*;
use crate::pgfault::{set_pgfault_handler, UTrapframe, FEC_WR};
use crate::syscall::*;

/// COW fault handler: a write hit a copy-on-write page; give ourselves a
/// private writable copy.
fn pgfault(utf: &mut UTrapframe) {
    let addr = utf.fault_va;
    let err = utf.err;

    // Only a write to a page we marked COW is ours to fix. Anything else is
    // a real fault and the environment is better off dead.
    if err & FEC_WR == 0 {
        panic!("pgfault: not a write (err {:#x}, va {:#x})", err, addr);
    }
    let pte = uvpt(pgnum(addr));
    if pte & PTE_COW == 0 {
        panic!("pgfault: page not copy-on-write (va {:#x})", addr);
    }

    // Fresh page at the scratch address, copy the contents, swing it over
    // the faulting page, drop the scratch mapping.
    let page_va = round_down(addr, PGSIZE);
    let r = sys_page_alloc(0, PFTEMP, PTE_P | PTE_U | PTE_W);
    if r < 0 {
        panic!("pgfault: sys_page_alloc failed ({})", r);
    }
    unsafe {
        core::ptr::copy_nonoverlapping(page_va as *const u8, PFTEMP as *mut u8, PGSIZE as usize);
    }
    let r = sys_page_map(0, PFTEMP, 0, page_va, PTE_P | PTE_U | PTE_W);
    if r < 0 {
        panic!("pgfault: sys_page_map failed ({})", r);
    }
    let r = sys_page_unmap(0, PFTEMP);
    if r < 0 {
        panic!("pgfault: sys_page_unmap failed ({})", r);
    }
}

/// Share page `pn` with `envid` at the same virtual address. Writable and
/// COW pages go over as COW: into the child first, then re-mapped over our
/// own copy so our next write faults as well. Read-only pages are shared
/// outright.
fn duppage(envid: i64, pn: u64) -> i64 {
    let va = pn << PGSHIFT;
    let pte = uvpt(pn);

    if pte & (PTE_W | PTE_COW) != 0 {
        let r = sys_page_map(0, va, envid, va, PTE_P | PTE_U | PTE_COW);
        if r < 0 {
            return r;
        }
        let r = sys_page_map(0, va, 0, va, PTE_P | PTE_U | PTE_COW);
        if r < 0 {
            return r;
        }
    } else {
        let r = sys_page_map(0, va, envid, va, PTE_P | PTE_U);
        if r < 0 {
            return r;
        }
    }
    0
}

/// Copy-on-write fork. Returns the child's envid to the parent, 0 to the
/// child. Panics on failure; there is no half-forked recovery.
pub fn fork() -> i64 {
    set_pgfault_handler(pgfault);

    let envid = sys_exofork();
    if envid < 0 {
        panic!("fork: sys_exofork failed ({})", envid);
    }
    if envid == 0 {
        // Child: the inherited thisenv pointer is the parent's.
        init_thisenv();
        return 0;
    }

    // Parent: walk our own page tables through the self-map windows and
    // share every present user page below UTOP, except the exception stack.
    'walk: for i in 0..NPTENTRIES as u64 {
        if (i << 39) >= UTOP {
            break;
        }
        if uvpml4e(i) & PTE_P == 0 {
            continue;
        }
        for j in 0..NPTENTRIES as u64 {
            let pdpe_index = i * NPTENTRIES as u64 + j;
            if uvpde(pdpe_index) & PTE_P == 0 {
                continue;
            }
            for k in 0..NPTENTRIES as u64 {
                let pde_index = pdpe_index * NPTENTRIES as u64 + k;
                if uvpd(pde_index) & PTE_P == 0 {
                    continue;
                }
                for l in 0..NPTENTRIES as u64 {
                    let pn = pde_index * NPTENTRIES as u64 + l;
                    let va = pn << PGSHIFT;
                    if va >= UTOP {
                        break 'walk;
                    }
                    if va >= UXSTACKTOP - PGSIZE && va < UXSTACKTOP {
                        continue;
                    }
                    if uvpt(pn) & PTE_P == 0 {
                        continue;
                    }
                    let r = duppage(envid, pn);
                    if r < 0 {
                        panic!("fork: duppage failed ({}) at va {:#x}", r, va);
                    }
                }
            }
        }
    }

    // The child's exception stack must be its own page, never COW.
    let r = sys_page_alloc(envid, UXSTACKTOP - PGSIZE, PTE_P | PTE_U | PTE_W);
    if r < 0 {
        panic!("fork: exception stack allocation failed ({})", r);
    }
    let r = sys_env_set_pgfault_upcall(envid, crate::pgfault::_pgfault_upcall as usize as u64);
    if r < 0 {
        panic!("fork: upcall registration failed ({})", r);
    }
    let r = sys_env_set_status(envid, ENV_RUNNABLE);
    if r < 0 {
        panic!("fork: sys_env_set_status failed ({})", r);
    }

    envid
}
