mod common;

use common::{Call, MockKernel, Primitive};
use exos::{
    ExoError,
    addressing::{Pa, Va, PAGE_SIZE, PD_SIZE},
    env::{EnvId, EnvStatus, ThisEnv},
    mm::{
        Level, MAX_USER_ADDRESS, Permission,
        page_table::{EntryFlags, PteFlags},
    },
    syscall::ExoKernel,
};
use exos_ulib::{Forked, fork, sfork, uvpt};

fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

fn pa(addr: usize) -> Pa {
    Pa::new(addr).unwrap()
}

/// A parent with a private writable page, a read-only executable page, a
/// shared writable page and a private 2 MiB superpage.
fn populated() -> MockKernel {
    let kernel = MockKernel::new();
    kernel.with_page_table(EnvId::SELF, |pgtbl| {
        pgtbl
            .map(va(0x40_0000), pa(0x10_0000), PteFlags::RW | PteFlags::US | PteFlags::XD)
            .unwrap();
        pgtbl
            .map(va(0x40_1000), pa(0x10_1000), PteFlags::US)
            .unwrap();
        pgtbl
            .map(
                va(0x50_0000),
                pa(0x20_0000),
                PteFlags::RW | PteFlags::US | PteFlags::SHARE,
            )
            .unwrap();
        pgtbl
            .map_superpage(
                va(4 * PD_SIZE),
                Level::Pd,
                pa(8 * PD_SIZE),
                EntryFlags::RW | EntryFlags::US,
            )
            .unwrap();
    });
    kernel.set_own_upcall(Some(va(0x80_0000)));
    kernel
}

#[test]
fn parent_gets_a_runnable_child() {
    let kernel = populated();
    let mut thisenv = ThisEnv::resolve(&kernel);
    let parent = kernel.current();

    let forked = fork(&kernel, &mut thisenv).unwrap();
    let Forked::Parent(child) = forked else {
        panic!("expected the parent side, got {forked:?}");
    };
    assert_eq!(forked.envid(), child);
    assert_eq!(thisenv.envx(), parent.envx());

    let env = kernel.env(child).unwrap();
    assert_eq!(env.status(), Some(EnvStatus::Runnable));
    assert_eq!(env.env_parent_id, parent);
    assert_eq!(env.pgfault_upcall(), Some(va(0x80_0000)));
}

#[test]
fn address_space_is_copied_with_one_lazy_bulk_mapping() {
    let kernel = populated();
    let mut thisenv = ThisEnv::resolve(&kernel);
    let child = fork(&kernel, &mut thisenv).unwrap().envid();

    assert_eq!(
        kernel.calls(),
        [
            Call::Exofork,
            Call::MapRegion {
                src: EnvId::SELF,
                src_va: Va::ZERO,
                dst: child,
                dst_va: Va::ZERO,
                size: MAX_USER_ADDRESS,
                perm: Permission::ALL | Permission::LAZY | Permission::COMBINE,
            },
            Call::SetPgfaultUpcall(child, Some(va(0x80_0000))),
            Call::SetStatus(child, EnvStatus::Runnable),
        ]
    );
}

#[test]
fn pages_are_aliased_until_written() {
    let kernel = populated();
    let mut thisenv = ThisEnv::resolve(&kernel);
    let child = fork(&kernel, &mut thisenv).unwrap().envid();

    let parent_pages = kernel.mappings(EnvId::SELF);
    let child_pages = kernel.mappings(child);
    assert_eq!(parent_pages.len(), 4);
    assert_eq!(child_pages.len(), 4);
    for ((pva, plevel, pentry), (cva, clevel, centry)) in parent_pages.iter().zip(&child_pages) {
        assert_eq!(pva, cva);
        assert_eq!(plevel, clevel);
        assert_eq!(pentry.pa(), centry.pa());
    }

    kernel.with_page_table(EnvId::SELF, |parent| {
        // Private writable memory became copy-on-write on the parent's side
        // too, shared memory stayed writable.
        assert!(!uvpt::permissions_of(parent, 0x40_0000).contains(Permission::WRITE));
        assert!(!uvpt::permissions_of(parent, 4 * PD_SIZE).contains(Permission::WRITE));
        assert!(uvpt::permissions_of(parent, 0x50_0000).contains(Permission::WRITE));
    });
}

#[test]
fn child_sees_its_own_permissions() {
    let kernel = populated();
    let mut thisenv = ThisEnv::resolve(&kernel);
    let child = fork(&kernel, &mut thisenv).unwrap().envid();

    let perms: Vec<Permission> = kernel.with_page_table(child, |pgtbl| {
        [0x40_0000, 0x40_1000, 0x50_0000, 4 * PD_SIZE + PAGE_SIZE]
            .into_iter()
            .map(|addr| uvpt::permissions_of(pgtbl, addr))
            .collect()
    });
    assert_eq!(
        perms,
        [
            Permission::READ,
            Permission::READ | Permission::EXECUTABLE,
            Permission::ALL | Permission::SHARE,
            Permission::READ | Permission::EXECUTABLE,
        ]
    );
}

#[test]
fn child_resolves_its_own_environment() {
    let kernel = populated();
    let mut thisenv = ThisEnv::resolve(&kernel);
    let child = fork(&kernel, &mut thisenv).unwrap().envid();

    // The child starts with the parent's memory, handle included.
    let mut inherited = thisenv.clone();
    kernel.enter(child);
    kernel.resume_as_child();
    let forked = fork(&kernel, &mut inherited).unwrap();

    assert_eq!(forked, Forked::Child);
    assert_eq!(forked.envid(), EnvId(0));
    assert_eq!(inherited.envx(), child.envx());
    assert_ne!(inherited, thisenv);
    assert_eq!(inherited.get(&kernel).map(|env| env.env_id), Some(child));
    // The child side asks the kernel for nothing but its identity.
    assert_eq!(kernel.calls().last(), Some(&Call::Exofork));
}

#[test]
fn exofork_failure_is_returned_as_is() {
    let kernel = populated();
    kernel.fail(Primitive::Exofork, ExoError::NoFreeEnv);
    let mut thisenv = ThisEnv::resolve(&kernel);

    let e = fork(&kernel, &mut thisenv).unwrap_err();
    assert_eq!(e, ExoError::NoFreeEnv);
    assert!(e.is_resource_exhaustion());
    assert_eq!(kernel.calls(), [Call::Exofork]);
}

#[test]
fn failed_bulk_mapping_leaves_no_trace() {
    let kernel = populated();
    let before = kernel.mappings(EnvId::SELF);
    kernel.fail(Primitive::MapRegion, ExoError::NoMemory);
    let mut thisenv = ThisEnv::resolve(&kernel);

    assert_eq!(fork(&kernel, &mut thisenv), Err(ExoError::NoMemory));

    let child = kernel.last_created().unwrap();
    assert_eq!(kernel.env(child), None);
    assert_eq!(kernel.calls().last(), Some(&Call::Destroy(child)));
    assert_eq!(kernel.mappings(EnvId::SELF), before);
}

#[test]
fn rollback_on_every_later_step() {
    for (primitive, e) in [
        (Primitive::MapRegion, ExoError::NoMemory),
        (Primitive::SetPgfaultUpcall, ExoError::BadAddress),
        (Primitive::SetStatus, ExoError::InvalidArgument),
    ] {
        let kernel = populated();
        kernel.fail(primitive, e);
        let mut thisenv = ThisEnv::resolve(&kernel);

        assert_eq!(fork(&kernel, &mut thisenv), Err(e), "{primitive:?}");
        let child = kernel.last_created().unwrap();
        assert_eq!(kernel.calls().last(), Some(&Call::Destroy(child)));

        // The identifier is dead for every later primitive.
        kernel.clear_faults();
        assert_eq!(
            kernel.map_region(EnvId::SELF, Va::ZERO, child, Va::ZERO, PAGE_SIZE, Permission::ALL),
            Err(ExoError::BadEnv)
        );
        assert_eq!(
            kernel.env_set_status(child, EnvStatus::Runnable),
            Err(ExoError::BadEnv)
        );
        assert_eq!(kernel.env_destroy(child), Err(ExoError::BadEnv));
    }
}

#[test]
#[should_panic(expected = "Fork double fault")]
fn failed_rollback_is_fatal() {
    let kernel = populated();
    kernel.fail(Primitive::SetStatus, ExoError::InvalidArgument);
    kernel.fail(Primitive::Destroy, ExoError::BadEnv);
    let mut thisenv = ThisEnv::resolve(&kernel);

    let _ = fork(&kernel, &mut thisenv);
}

#[test]
fn sfork_is_not_supported() {
    let kernel = populated();
    let mut thisenv = ThisEnv::resolve(&kernel);

    assert_eq!(sfork(&kernel, &mut thisenv), Err(ExoError::NotSupported));
    assert!(kernel.calls().is_empty());
}

#[test]
fn parent_without_upcall_clears_the_child_one() {
    let kernel = populated();
    kernel.set_own_upcall(None);
    let mut thisenv = ThisEnv::resolve(&kernel);

    let child = fork(&kernel, &mut thisenv).unwrap().envid();
    assert!(kernel.calls().contains(&Call::SetPgfaultUpcall(child, None)));
    assert_eq!(kernel.env(child).unwrap().pgfault_upcall(), None);
}
