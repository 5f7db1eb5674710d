    //! Alocador de páginas físicas.
    //!
    //! O VM só fala com o alocador através de `PhysAllocator`. O conteúdo de um
    //! frame é acessado pelo seu endereço virtual de kernel (`Kva`), como no
    //! mapeamento `physical_memory_offset` do bootloader.

    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    use bitflags::bitflags;
    use spin::Mutex;
    use x86_64::VirtAddr;

    use super::PAGE_SIZE;

    /// Endereço virtual de kernel de um frame físico.
    pub type Kva = VirtAddr;

    bitflags! {
        /// Opções de alocação de página.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct PallocFlags: u32 {
            /// Zera a página antes de entregá-la.
            const ZERO = 1 << 0;
            /// Página vem do pool de usuário.
            const USER = 1 << 1;
        }
    }

    /// Fonte de páginas físicas de tamanho fixo.
    ///
    /// `read`/`write` acessam o conteúdo de uma página entregue por
    /// `alloc_page` e ainda não devolvida; qualquer outro `kva` é um bug do
    /// chamador e causa panic.
    pub trait PhysAllocator: Send + Sync {
        /// Aloca uma página; `None` quando a memória acabou.
        fn alloc_page(&self, flags: PallocFlags) -> Option<Kva>;

        /// Devolve uma página ao alocador.
        fn free_page(&self, kva: Kva);

        /// Copia `buf.len()` bytes da página a partir de `offset`.
        fn read(&self, kva: Kva, offset: usize, buf: &mut [u8]);

        /// Copia `data` para a página a partir de `offset`.
        fn write(&self, kva: Kva, offset: usize, data: &[u8]);

        fn zero(&self, kva: Kva) {
            self.write(kva, 0, &[0u8; PAGE_SIZE]);
        }

        /// Copia o conteúdo inteiro de `src` para `dst`.
        fn copy(&self, dst: Kva, src: Kva) {
            let mut buf = vec![0u8; PAGE_SIZE];
            self.read(src, 0, &mut buf);
            self.write(dst, 0, &buf);
        }
    }

    struct Bitmap {
        bits: Vec<u64>,
        free_frames: usize,
        cursor_word: usize,
    }

    /// Alocador físico em bitmap de frames 4KiB sobre uma arena própria.
    ///
    /// - bit=1 => usado
    /// - bit=0 => livre
    pub struct BitmapFrameAllocator {
        phys_offset: VirtAddr,
        total_frames: usize,
        bitmap: Mutex<Bitmap>,
        frames: Vec<Mutex<Box<[u8; PAGE_SIZE]>>>,
    }

    impl BitmapFrameAllocator {
        /// Offset padrão da memória física no espaço do kernel.
        pub const DEFAULT_PHYS_OFFSET: u64 = 0xffff_8000_0000_0000;

        pub fn new(total_frames: usize) -> Self {
            Self::with_offset(total_frames, VirtAddr::new(Self::DEFAULT_PHYS_OFFSET))
        }

        pub fn with_offset(total_frames: usize, phys_offset: VirtAddr) -> Self {
            let words = (total_frames + 63) / 64;
            let mut bits = vec![0u64; words];

            // Bits além do último frame ficam marcados como usados.
            for f in total_frames..words * 64 {
                set_bit(&mut bits, f);
            }

            let frames = (0..total_frames)
                .map(|_| Mutex::new(Box::new([0u8; PAGE_SIZE])))
                .collect();

            Self {
                phys_offset,
                total_frames,
                bitmap: Mutex::new(Bitmap {
                    bits,
                    free_frames: total_frames,
                    cursor_word: 0,
                }),
                frames,
            }
        }

        pub fn total_frames(&self) -> usize {
            self.total_frames
        }

        pub fn free_frames(&self) -> usize {
            self.bitmap.lock().free_frames
        }

        pub fn used_frames(&self) -> usize {
            self.total_frames - self.free_frames()
        }

        /// Índice do frame de `kva`, se pertencer à arena.
        fn index_of(&self, kva: Kva) -> Option<usize> {
            let off = kva.as_u64().checked_sub(self.phys_offset.as_u64())?;
            if off % PAGE_SIZE as u64 != 0 {
                return None;
            }
            let idx = (off / PAGE_SIZE as u64) as usize;
            (idx < self.total_frames).then_some(idx)
        }

        fn frame(&self, kva: Kva) -> &Mutex<Box<[u8; PAGE_SIZE]>> {
            match self.index_of(kva) {
                Some(idx) => &self.frames[idx],
                None => panic!("phys: kva {:#x} fora da arena", kva.as_u64()),
            }
        }
    }

    impl Bitmap {
        fn find_free(&mut self) -> Option<usize> {
            let n = self.bits.len();
            for step in 0..n {
                let wi = (self.cursor_word + step) % n;
                let word = self.bits[wi];
                if word == u64::MAX {
                    continue; // tudo usado
                }
                // Temos algum bit 0 (livre). Encontra o primeiro.
                let bit = (!word).trailing_zeros() as usize;
                self.cursor_word = wi;
                return Some(wi * 64 + bit);
            }
            None
        }
    }

    impl PhysAllocator for BitmapFrameAllocator {
        fn alloc_page(&self, flags: PallocFlags) -> Option<Kva> {
            let idx = {
                let mut bm = self.bitmap.lock();
                let idx = bm.find_free()?;
                set_bit(&mut bm.bits, idx);
                bm.free_frames = bm.free_frames.saturating_sub(1);
                idx
            };
            if flags.contains(PallocFlags::ZERO) {
                self.frames[idx].lock().fill(0);
            }
            Some(self.phys_offset + (idx * PAGE_SIZE) as u64)
        }

        fn free_page(&self, kva: Kva) {
            let Some(idx) = self.index_of(kva) else {
                log::warn!("phys: free de kva desconhecido {:#x}", kva.as_u64());
                return;
            };
            let mut bm = self.bitmap.lock();
            if get_bit(&bm.bits, idx) {
                clear_bit(&mut bm.bits, idx);
                bm.free_frames += 1;
            }
        }

        fn read(&self, kva: Kva, offset: usize, buf: &mut [u8]) {
            let page = self.frame(kva).lock();
            buf.copy_from_slice(&page[offset..offset + buf.len()]);
        }

        fn write(&self, kva: Kva, offset: usize, data: &[u8]) {
            let mut page = self.frame(kva).lock();
            page[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    #[inline]
    fn word_bit(i: usize) -> (usize, u64) {
        let word = i / 64;
        let bit = (i % 64) as u64;
        (word, 1u64 << bit)
    }

    #[inline]
    fn get_bit(bits: &[u64], i: usize) -> bool {
        let (w, m) = word_bit(i);
        (bits[w] & m) != 0
    }

    #[inline]
    fn set_bit(bits: &mut [u64], i: usize) {
        let (w, m) = word_bit(i);
        bits[w] |= m;
    }

    #[inline]
    fn clear_bit(bits: &mut [u64], i: usize) {
        let (w, m) = word_bit(i);
        bits[w] &= !m;
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_allocates_until_exhausted() {
            let pa = BitmapFrameAllocator::new(3);
            let a = pa.alloc_page(PallocFlags::USER).unwrap();
            let b = pa.alloc_page(PallocFlags::USER).unwrap();
            let c = pa.alloc_page(PallocFlags::USER).unwrap();
            assert_ne!(a, b);
            assert_ne!(b, c);
            assert!(pa.alloc_page(PallocFlags::USER).is_none());
            assert_eq!(pa.used_frames(), 3);

            pa.free_page(b);
            assert_eq!(pa.free_frames(), 1);
            assert_eq!(pa.alloc_page(PallocFlags::USER), Some(b));
        }

        #[test]
        fn test_zero_flag_scrubs_reused_page() {
            let pa = BitmapFrameAllocator::new(1);
            let kva = pa.alloc_page(PallocFlags::empty()).unwrap();
            pa.write(kva, 100, &[7, 7, 7]);
            pa.free_page(kva);

            let kva = pa.alloc_page(PallocFlags::ZERO | PallocFlags::USER).unwrap();
            let mut buf = [1u8; 3];
            pa.read(kva, 100, &mut buf);
            assert_eq!(buf, [0, 0, 0]);
        }

        #[test]
        fn test_double_free_is_ignored() {
            let pa = BitmapFrameAllocator::new(2);
            let kva = pa.alloc_page(PallocFlags::USER).unwrap();
            pa.free_page(kva);
            pa.free_page(kva);
            assert_eq!(pa.free_frames(), 2);
        }

        #[test]
        fn test_copy_page() {
            let pa = BitmapFrameAllocator::new(2);
            let src = pa.alloc_page(PallocFlags::ZERO).unwrap();
            let dst = pa.alloc_page(PallocFlags::ZERO).unwrap();
            pa.write(src, PAGE_SIZE - 2, &[0xAA, 0xBB]);
            pa.copy(dst, src);
            let mut buf = [0u8; 2];
            pa.read(dst, PAGE_SIZE - 2, &mut buf);
            assert_eq!(buf, [0xAA, 0xBB]);
        }
    }
