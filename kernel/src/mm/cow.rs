//! Copy-on-Write (CoW)
//!
//! O fork marca as páginas anônimas graváveis como somente-leitura e
//! compartilhadas. Quando um processo tenta escrever, ocorre um page fault de
//! proteção e a página ganha um frame privado nesse momento.
//!
//! Quem escreve sempre recebe o frame novo; os outros donos continuam com o
//! original.

use core::sync::atomic::Ordering;

use super::frame::FrameOwner;
use super::page::{Page, PageRef};
use super::phys::Kva;
use super::Vm;
use crate::util::{KError, KResult};

impl Vm {
    /// Processa um write fault numa página presente mas read-only.
    pub(super) fn handle_wp(&self, page_ref: &PageRef) -> KResult<()> {
        loop {
            let mut page = page_ref.lock();
            if !page.copy_on_write {
                // Outro contexto já resolveu, ou a página é read-only de fato
                return if page.writable {
                    Ok(())
                } else {
                    Err(KError::PermissionDenied)
                };
            }

            let Some(old) = page.frame else {
                // Foi despejada: traz de volta e tenta de novo
                drop(page);
                self.do_claim_page(page_ref)?;
                continue;
            };

            if self.frames.ref_count(old) <= 1 {
                // Único dono - só torna writable, sem copiar
                return make_writable(&mut page, old);
            }

            // ref_count > 1: precisa de um frame novo. Não se aloca com o lock
            // da página (a alocação pode despejar).
            drop(page);
            let new = self.acquire_frame()?;
            let mut page = page_ref.lock();

            let current = page.frame;
            match current {
                Some(old) if page.copy_on_write && self.frames.ref_count(old) > 1 => {
                    self.palloc.copy(new, old);
                    page.frame = Some(new);
                    self.frames.release(old, page.space(), page.va);
                    self.frames.install(new, FrameOwner::new(page_ref, &page));
                    self.counters.cow_copies.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "cow: {:#x} copied {:#x} -> {:#x}",
                        page.va.as_u64(),
                        old.as_u64(),
                        new.as_u64()
                    );
                    return make_writable(&mut page, new);
                }
                Some(old) if page.copy_on_write => {
                    // Os outros donos saíram enquanto alocávamos
                    self.frames.release(new, page.space(), page.va);
                    return make_writable(&mut page, old);
                }
                None if page.copy_on_write => {
                    // Despejada enquanto alocávamos: materializa no frame novo
                    page.frame = Some(new);
                    if let Err(e) = self.swap_in(&mut page, new) {
                        page.frame = None;
                        self.frames.release(new, page.space(), page.va);
                        return Err(e);
                    }
                    self.frames.install(new, FrameOwner::new(page_ref, &page));
                    return make_writable(&mut page, new);
                }
                _ => {
                    self.frames.release(new, page.space(), page.va);
                }
            }
        }
    }
}

fn make_writable(page: &mut Page, kva: Kva) -> KResult<()> {
    page.writable = true;
    page.copy_on_write = false;
    page.mapper().map(page.va, kva, true)
}
