//! A simulated exokernel for host tests.
//!
//! Every environment owns a heap-backed [`PageTable`]. Primitives behave like
//! the real ones as far as the library can observe, log every call, and can
//! be made to fail on demand.

#![allow(dead_code)]

use exos::{
    ExoError,
    addressing::{Pa, Va},
    env::{Env, EnvId, EnvStatus, NENV},
    mm::{
        Level, PageTableView, Permission,
        page_table::{Entry, EntryFlags, PageTable, PteFlags},
    },
    syscall::ExoKernel,
};
use std::{cell::RefCell, collections::BTreeMap};

/// A kernel primitive, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Exofork,
    MapRegion,
    SetPgfaultUpcall,
    SetStatus,
    Destroy,
}

/// A primitive invocation, as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exofork,
    MapRegion {
        src: EnvId,
        src_va: Va,
        dst: EnvId,
        dst_va: Va,
        size: usize,
        perm: Permission,
    },
    SetPgfaultUpcall(EnvId, Option<Va>),
    SetStatus(EnvId, EnvStatus),
    Destroy(EnvId),
}

pub struct Slot {
    pub env: Env,
    pub pgtbl: PageTable,
}

struct State {
    slots: BTreeMap<usize, Slot>,
    current: EnvId,
    generation: i32,
    faults: Vec<(Primitive, ExoError)>,
    calls: Vec<Call>,
    resume_as_child: bool,
    last_created: Option<EnvId>,
    console: String,
}

impl State {
    fn check(&self, primitive: Primitive) -> Result<(), ExoError> {
        match self.faults.iter().find(|(p, _)| *p == primitive) {
            Some((_, e)) => Err(*e),
            None => Ok(()),
        }
    }

    fn resolve(&self, id: EnvId) -> Result<usize, ExoError> {
        let id = if id == EnvId::SELF { self.current } else { id };
        match self.slots.get(&id.envx()) {
            Some(slot) if slot.env.env_id == id => Ok(id.envx()),
            _ => Err(ExoError::BadEnv),
        }
    }

    fn alloc_id(&mut self) -> Result<EnvId, ExoError> {
        let envx = (0..NENV)
            .find(|envx| !self.slots.contains_key(envx))
            .ok_or(ExoError::NoFreeEnv)?;
        self.generation += 1;
        Ok(EnvId((self.generation << 10) | envx as i32))
    }
}

pub struct MockKernel {
    state: RefCell<State>,
}

impl MockKernel {
    /// A kernel running a single environment with an empty address space.
    pub fn new() -> Self {
        let mut state = State {
            slots: BTreeMap::new(),
            current: EnvId::SELF,
            generation: 0,
            faults: Vec::new(),
            calls: Vec::new(),
            resume_as_child: false,
            last_created: None,
            console: String::new(),
        };
        let id = state.alloc_id().unwrap();
        state.slots.insert(
            id.envx(),
            Slot {
                env: Env {
                    env_id: id,
                    env_parent_id: EnvId::SELF,
                    env_status: EnvStatus::Running.into(),
                    env_pgfault_upcall: 0,
                },
                pgtbl: PageTable::new(),
            },
        );
        state.current = id;
        Self {
            state: RefCell::new(state),
        }
    }

    /// The running environment.
    pub fn current(&self) -> EnvId {
        self.state.borrow().current
    }

    /// Run `f` on the page table of `id`.
    pub fn with_page_table<R>(&self, id: EnvId, f: impl FnOnce(&mut PageTable) -> R) -> R {
        let mut state = self.state.borrow_mut();
        let envx = state.resolve(id).unwrap();
        f(&mut state.slots.get_mut(&envx).unwrap().pgtbl)
    }

    /// Snapshot of every mapping of `id`.
    pub fn mappings(&self, id: EnvId) -> Vec<(Va, Level, Entry)> {
        let mut out = Vec::new();
        self.with_page_table(id, |pgtbl| {
            pgtbl.for_each_terminal(|va, level, entry| out.push((va, level, entry)))
        });
        out
    }

    /// Control block of `id`, if it is alive.
    pub fn env(&self, id: EnvId) -> Option<Env> {
        let state = self.state.borrow();
        let envx = state.resolve(id).ok()?;
        state.slots.get(&envx).map(|slot| slot.env)
    }

    /// Register the upcall of the running environment without logging a call.
    pub fn set_own_upcall(&self, upcall: Option<Va>) {
        let mut state = self.state.borrow_mut();
        let envx = state.resolve(EnvId::SELF).unwrap();
        state.slots.get_mut(&envx).unwrap().env.env_pgfault_upcall =
            upcall.map_or(0, Va::into_usize);
    }

    /// Make every later invocation of `primitive` fail with `e`.
    pub fn fail(&self, primitive: Primitive, e: ExoError) {
        self.state.borrow_mut().faults.push((primitive, e));
    }

    /// Stop injecting failures.
    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// Make the next `exofork` behave as it does inside the child.
    pub fn resume_as_child(&self) {
        self.state.borrow_mut().resume_as_child = true;
    }

    /// Switch the running environment.
    pub fn enter(&self, id: EnvId) {
        let mut state = self.state.borrow_mut();
        state.resolve(id).unwrap();
        state.current = id;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn last_created(&self) -> Option<EnvId> {
        self.state.borrow().last_created
    }

    pub fn console(&self) -> String {
        self.state.borrow().console.clone()
    }
}

fn restrict(mut flags: EntryFlags, perm: Permission) -> EntryFlags {
    if !perm.contains(Permission::WRITE) {
        flags.remove(EntryFlags::RW);
    }
    if !perm.contains(Permission::EXECUTABLE) {
        flags.insert(EntryFlags::XD);
    }
    if perm.contains(Permission::LAZY) && !flags.contains(EntryFlags::SHARE) {
        flags.remove(EntryFlags::RW);
    }
    flags
}

impl ExoKernel for MockKernel {
    fn cputs(&self, s: &str) -> Result<(), ExoError> {
        self.state.borrow_mut().console.push_str(s);
        Ok(())
    }

    fn getenvid(&self) -> EnvId {
        self.state.borrow().current
    }

    fn exofork(&self) -> Result<EnvId, ExoError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Exofork);
        state.check(Primitive::Exofork)?;
        if std::mem::take(&mut state.resume_as_child) {
            return Ok(EnvId::SELF);
        }

        let id = state.alloc_id()?;
        let parent = state.current;
        state.slots.insert(
            id.envx(),
            Slot {
                env: Env {
                    env_id: id,
                    env_parent_id: parent,
                    env_status: EnvStatus::NotRunnable.into(),
                    env_pgfault_upcall: 0,
                },
                pgtbl: PageTable::new(),
            },
        );
        state.last_created = Some(id);
        Ok(id)
    }

    fn map_region(
        &self,
        src: EnvId,
        src_va: Va,
        dst: EnvId,
        dst_va: Va,
        size: usize,
        perm: Permission,
    ) -> Result<(), ExoError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::MapRegion {
            src,
            src_va,
            dst,
            dst_va,
            size,
            perm,
        });
        state.check(Primitive::MapRegion)?;
        let src = state.resolve(src)?;
        let dst = state.resolve(dst)?;
        if src == dst || src_va.offset() != 0 || dst_va.offset() != 0 || size % 0x1000 != 0 {
            return Err(ExoError::InvalidArgument);
        }

        let end = src_va.into_usize() + size;
        let mut plan = Vec::new();
        state.slots[&src].pgtbl.for_each_terminal(|va, level, entry| {
            if (src_va.into_usize()..end).contains(&va.into_usize()) {
                plan.push((va, level, entry));
            }
        });

        // Nothing is modified unless every target is free.
        let target = |va: Va| dst_va + (va - src_va);
        let dst_table = &state.slots[&dst].pgtbl;
        for (va, _, _) in &plan {
            let t = target(*va);
            if dst_table.pml4e(t).is_present()
                && dst_table.pdpe(t).is_present()
                && (dst_table.pdpe(t).is_superpage()
                    || dst_table.pde(t).is_superpage()
                    || dst_table.pte(t).is_present())
            {
                return Err(ExoError::InvalidArgument);
            }
        }

        for (va, level, entry) in plan {
            let flags = restrict(entry.flags(), perm);
            let pa = entry.pa().unwrap_or(Pa::ZERO);
            let slot = state.slots.get_mut(&dst).unwrap();
            let mapped = match level {
                Level::Pt => slot
                    .pgtbl
                    .map(target(va), pa, PteFlags::from_bits_truncate(flags.bits())),
                level => slot
                    .pgtbl
                    .map_superpage(target(va), level, pa, flags - EntryFlags::PS),
            };
            mapped.map_err(|_| ExoError::InvalidArgument)?;

            if perm.contains(Permission::LAZY) && !flags.contains(EntryFlags::SHARE) {
                let slot = state.slots.get_mut(&src).unwrap();
                slot.pgtbl
                    .update(va, |f| f - EntryFlags::RW)
                    .map_err(|_| ExoError::InvalidArgument)?;
            }
        }
        Ok(())
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: Option<Va>) -> Result<(), ExoError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::SetPgfaultUpcall(env, upcall));
        state.check(Primitive::SetPgfaultUpcall)?;
        let envx = state.resolve(env)?;
        state.slots.get_mut(&envx).unwrap().env.env_pgfault_upcall =
            upcall.map_or(0, Va::into_usize);
        Ok(())
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), ExoError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::SetStatus(env, status));
        state.check(Primitive::SetStatus)?;
        let envx = state.resolve(env)?;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(ExoError::InvalidArgument);
        }
        state.slots.get_mut(&envx).unwrap().env.env_status = status.into();
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> Result<(), ExoError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Destroy(env));
        state.check(Primitive::Destroy)?;
        let envx = state.resolve(env)?;
        state.slots.remove(&envx);
        Ok(())
    }

    fn env_at(&self, envx: usize) -> Option<Env> {
        if envx >= NENV {
            return None;
        }
        let state = self.state.borrow();
        Some(state.slots.get(&envx).map_or(
            Env {
                env_id: EnvId::SELF,
                env_parent_id: EnvId::SELF,
                env_status: EnvStatus::Free.into(),
                env_pgfault_upcall: 0,
            },
            |slot| slot.env,
        ))
    }
}
