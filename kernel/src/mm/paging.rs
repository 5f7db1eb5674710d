    //! Tradução de endereços de hardware.
    //!
    //! O VM instala/remove mapeamentos e consulta os bits accessed/dirty através
    //! de `PageMapper`. `SoftPageTable` é uma implementação em software com
    //! `PageTableFlags` do x86_64, que também simula loads/stores do usuário e
    //! levanta os page faults que a CPU levantaria.

    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;

    use spin::Mutex;
    use x86_64::structures::paging::PageTableFlags;
    use x86_64::VirtAddr;

    use super::fault::Fault;
    use super::phys::{Kva, PhysAllocator};
    use super::{pg_ofs, pg_round_down, PAGE_SIZE};
    use crate::util::{KError, KResult};

    /// Page table de um espaço de endereçamento.
    ///
    /// Métodos recebem `&self`: o evictor de outro contexto também mexe nos
    /// bits desta tabela.
    pub trait PageMapper: Send + Sync {
        /// Instala (ou substitui) `upage -> kva`. Zera accessed/dirty.
        fn map(&self, upage: VirtAddr, kva: Kva, writable: bool) -> KResult<()>;

        /// Marca `upage` como não presente. Os bits accessed/dirty continuam
        /// consultáveis até o próximo `map`.
        fn clear(&self, upage: VirtAddr);

        /// Frame mapeado em `upage`, se presente.
        fn translate(&self, upage: VirtAddr) -> Option<Kva>;

        fn is_accessed(&self, upage: VirtAddr) -> bool;
        fn set_accessed(&self, upage: VirtAddr, accessed: bool);

        fn is_dirty(&self, upage: VirtAddr) -> bool;
        fn set_dirty(&self, upage: VirtAddr, dirty: bool);
    }

    #[derive(Debug, Clone, Copy)]
    struct Pte {
        kva: Kva,
        flags: PageTableFlags,
    }

    /// Page table em software.
    pub struct SoftPageTable {
        palloc: Arc<dyn PhysAllocator>,
        entries: Mutex<BTreeMap<u64, Pte>>,
    }

    impl SoftPageTable {
        pub fn new(palloc: Arc<dyn PhysAllocator>) -> Self {
            Self {
                palloc,
                entries: Mutex::new(BTreeMap::new()),
            }
        }

        /// Flags atuais de `upage` (inclusive de entradas não presentes).
        pub fn flags(&self, upage: VirtAddr) -> Option<PageTableFlags> {
            self.entries
                .lock()
                .get(&pg_round_down(upage).as_u64())
                .map(|pte| pte.flags)
        }

        pub fn is_writable(&self, upage: VirtAddr) -> bool {
            self.flags(upage)
                .map(|f| f.contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE))
                .unwrap_or(false)
        }

        /// Número de páginas presentes.
        pub fn present_pages(&self) -> usize {
            self.entries
                .lock()
                .values()
                .filter(|pte| pte.flags.contains(PageTableFlags::PRESENT))
                .count()
        }

        /// Load do usuário: lê `buf.len()` bytes a partir de `va`.
        ///
        /// Devolve o `Fault` da primeira página não presente.
        pub fn user_read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Fault> {
            let mut done = 0;
            while done < buf.len() {
                let addr = va + done as u64;
                let ofs = pg_ofs(addr);
                let n = (PAGE_SIZE - ofs).min(buf.len() - done);
                let kva = self.touch(addr, false)?;
                self.palloc.read(kva, ofs, &mut buf[done..done + n]);
                done += n;
            }
            Ok(())
        }

        /// Store do usuário: escreve `data` a partir de `va`.
        ///
        /// Devolve o `Fault` da primeira página não presente ou somente-leitura;
        /// bytes de páginas anteriores já foram escritos, como numa CPU real.
        pub fn user_write(&self, va: VirtAddr, data: &[u8]) -> Result<(), Fault> {
            let mut done = 0;
            while done < data.len() {
                let addr = va + done as u64;
                let ofs = pg_ofs(addr);
                let n = (PAGE_SIZE - ofs).min(data.len() - done);
                let kva = self.touch(addr, true)?;
                self.palloc.write(kva, ofs, &data[done..done + n]);
                done += n;
            }
            Ok(())
        }

        /// Faz o que o walker de hardware faz: checa presença e permissão e
        /// liga accessed (e dirty em escrita).
        fn touch(&self, addr: VirtAddr, write: bool) -> Result<Kva, Fault> {
            let mut entries = self.entries.lock();
            let pte = match entries.get_mut(&pg_round_down(addr).as_u64()) {
                Some(pte) if pte.flags.contains(PageTableFlags::PRESENT) => pte,
                _ => return Err(Fault::new(addr, write, true)),
            };
            if write && !pte.flags.contains(PageTableFlags::WRITABLE) {
                return Err(Fault::new(addr, write, false));
            }
            pte.flags.insert(PageTableFlags::ACCESSED);
            if write {
                pte.flags.insert(PageTableFlags::DIRTY);
            }
            Ok(pte.kva)
        }

        fn update(&self, upage: VirtAddr, flag: PageTableFlags, on: bool) {
            if let Some(pte) = self.entries.lock().get_mut(&pg_round_down(upage).as_u64()) {
                pte.flags.set(flag, on);
            }
        }

        fn test(&self, upage: VirtAddr, flag: PageTableFlags) -> bool {
            self.flags(upage).map(|f| f.contains(flag)).unwrap_or(false)
        }
    }

    impl PageMapper for SoftPageTable {
        fn map(&self, upage: VirtAddr, kva: Kva, writable: bool) -> KResult<()> {
            if !upage.is_aligned(PAGE_SIZE as u64) || !kva.is_aligned(PAGE_SIZE as u64) {
                return Err(KError::Invalid);
            }
            let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
            if writable {
                flags |= PageTableFlags::WRITABLE;
            }
            self.entries.lock().insert(upage.as_u64(), Pte { kva, flags });
            Ok(())
        }

        fn clear(&self, upage: VirtAddr) {
            self.update(upage, PageTableFlags::PRESENT, false);
        }

        fn translate(&self, upage: VirtAddr) -> Option<Kva> {
            self.entries
                .lock()
                .get(&pg_round_down(upage).as_u64())
                .filter(|pte| pte.flags.contains(PageTableFlags::PRESENT))
                .map(|pte| pte.kva)
        }

        fn is_accessed(&self, upage: VirtAddr) -> bool {
            self.test(upage, PageTableFlags::ACCESSED)
        }

        fn set_accessed(&self, upage: VirtAddr, accessed: bool) {
            self.update(upage, PageTableFlags::ACCESSED, accessed);
        }

        fn is_dirty(&self, upage: VirtAddr) -> bool {
            self.test(upage, PageTableFlags::DIRTY)
        }

        fn set_dirty(&self, upage: VirtAddr, dirty: bool) {
            self.update(upage, PageTableFlags::DIRTY, dirty);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::mm::phys::{BitmapFrameAllocator, PallocFlags};

        fn setup() -> (Arc<BitmapFrameAllocator>, SoftPageTable) {
            let pa = Arc::new(BitmapFrameAllocator::new(4));
            let pt = SoftPageTable::new(pa.clone());
            (pa, pt)
        }

        #[test]
        fn test_unmapped_access_faults() {
            let (_pa, pt) = setup();
            let va = VirtAddr::new(0x1000_0010);
            let mut buf = [0u8; 4];
            let fault = pt.user_read(va, &mut buf).unwrap_err();
            assert_eq!(fault.addr, va);
            assert!(fault.not_present);
            assert!(!fault.write);
        }

        #[test]
        fn test_write_sets_accessed_and_dirty() {
            let (pa, pt) = setup();
            let upage = VirtAddr::new(0x1000_0000);
            let kva = pa.alloc_page(PallocFlags::ZERO).unwrap();
            pt.map(upage, kva, true).unwrap();
            assert!(!pt.is_accessed(upage));

            pt.user_write(upage + 8u64, b"abc").unwrap();
            assert!(pt.is_accessed(upage));
            assert!(pt.is_dirty(upage));

            let mut buf = [0u8; 3];
            pa.read(kva, 8, &mut buf);
            assert_eq!(&buf, b"abc");
        }

        #[test]
        fn test_read_only_write_is_protection_fault() {
            let (pa, pt) = setup();
            let upage = VirtAddr::new(0x2000_0000);
            let kva = pa.alloc_page(PallocFlags::ZERO).unwrap();
            pt.map(upage, kva, false).unwrap();

            let fault = pt.user_write(upage, b"x").unwrap_err();
            assert!(fault.write);
            assert!(!fault.not_present);
            assert!(!pt.is_dirty(upage));
        }

        #[test]
        fn test_clear_keeps_dirty_until_remap() {
            let (pa, pt) = setup();
            let upage = VirtAddr::new(0x3000_0000);
            let kva = pa.alloc_page(PallocFlags::ZERO).unwrap();
            pt.map(upage, kva, true).unwrap();
            pt.user_write(upage, b"z").unwrap();

            pt.clear(upage);
            assert_eq!(pt.translate(upage), None);
            assert!(pt.is_dirty(upage));

            pt.map(upage, kva, true).unwrap();
            assert!(!pt.is_dirty(upage));
            assert_eq!(pt.translate(upage), Some(kva));
        }

        #[test]
        fn test_write_spanning_two_pages_faults_on_second() {
            let (pa, pt) = setup();
            let upage = VirtAddr::new(0x4000_0000);
            let kva = pa.alloc_page(PallocFlags::ZERO).unwrap();
            pt.map(upage, kva, true).unwrap();

            let start = upage + (PAGE_SIZE as u64 - 2);
            let fault = pt.user_write(start, b"abcd").unwrap_err();
            assert_eq!(fault.addr, upage + PAGE_SIZE as u64);

            let mut buf = [0u8; 2];
            pa.read(kva, PAGE_SIZE - 2, &mut buf);
            assert_eq!(&buf, b"ab");
        }

        #[test]
        fn test_rejects_unaligned_map() {
            let (pa, pt) = setup();
            let kva = pa.alloc_page(PallocFlags::ZERO).unwrap();
            assert_eq!(
                pt.map(VirtAddr::new(0x1001), kva, true),
                Err(KError::Invalid)
            );
        }
    }
