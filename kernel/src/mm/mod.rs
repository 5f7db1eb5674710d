    //! Memória virtual sob demanda.
    //!
    //! `Vm` é o subsistema global: tabela de frames, tabela de slots de swap e o
    //! alocador físico. Cada processo tem um `AddressSpace` (tabela de páginas
    //! suplementar + page table de hardware) que é passado explicitamente para as
    //! operações.

    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU64, Ordering};

    use x86_64::VirtAddr;

    use crate::storage::BlockDevice;
    use crate::util::KResult;

    pub mod anon;
    pub mod cow;
    pub mod fault;
    pub mod file;
    pub mod frame;
    pub mod page;
    pub mod paging;
    pub mod phys;
    pub mod spt;
    pub mod swap;

    #[cfg(test)]
    mod tests_prop;

    pub use fault::{Fault, FaultResult};
    pub use file::MappedFile;
    pub use frame::{FrameOwner, FrameState, FrameTable};
    pub use page::{
        AnonPage, FilePage, FileSlice, Page, PageInit, PageKind, PageRef, Residency, VmType,
    };
    pub use paging::{PageMapper, SoftPageTable};
    pub use phys::{BitmapFrameAllocator, Kva, PallocFlags, PhysAllocator};
    pub use spt::{AddressSpace, SpaceId, SupplementalPageTable};
    pub use swap::{SwapError, SwapSlot, SwapStats, SwapTable};

    /// Tamanho de página (4 KiB).
    pub const PAGE_SIZE: usize = 4096;

    /// Fim (exclusivo) da metade baixa canônica, o espaço de usuário.
    pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

    /// Arredonda `va` para o início da página.
    #[inline]
    pub fn pg_round_down(va: VirtAddr) -> VirtAddr {
        va.align_down(PAGE_SIZE as u64)
    }

    /// Deslocamento de `va` dentro da página.
    #[inline]
    pub fn pg_ofs(va: VirtAddr) -> usize {
        (va.as_u64() as usize) & (PAGE_SIZE - 1)
    }

    /// Parâmetros do subsistema.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmConfig {
        /// Topo (exclusivo) da stack de usuário.
        pub stack_top: u64,
        /// Tamanho máximo até onde a stack pode crescer.
        pub max_stack_size: u64,
        /// Quantos bytes abaixo do stack pointer um acesso ainda conta como
        /// crescimento de stack (PUSH escreve antes de decrementar rsp).
        pub stack_slack: u64,
    }

    impl VmConfig {
        pub const USER_STACK: u64 = 0x4748_0000;

        /// Base (inclusiva) da região de stack crescível.
        pub fn stack_bottom(&self) -> u64 {
            self.stack_top.saturating_sub(self.max_stack_size)
        }

        pub fn in_stack_region(&self, addr: u64) -> bool {
            addr >= self.stack_bottom() && addr < self.stack_top
        }
    }

    impl Default for VmConfig {
        fn default() -> Self {
            Self {
                stack_top: Self::USER_STACK,
                max_stack_size: 1 << 20,
                stack_slack: 32,
            }
        }
    }

    /// Contadores do subsistema.
    #[derive(Debug, Default)]
    struct VmCounters {
        faults: AtomicU64,
        evictions: AtomicU64,
        cow_copies: AtomicU64,
        stack_growths: AtomicU64,
    }

    /// Snapshot das estatísticas (ver `Vm::stats`).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct VmStats {
        pub faults: u64,
        pub evictions: u64,
        pub cow_copies: u64,
        pub stack_growths: u64,
        pub resident_frames: usize,
        pub swap: SwapStats,
    }

    /// O subsistema de memória virtual.
    pub struct Vm {
        config: VmConfig,
        palloc: Arc<dyn PhysAllocator>,
        frames: FrameTable,
        swap: SwapTable,
        counters: VmCounters,
    }

    impl Vm {
        /// Inicializa o subsistema: tabela de frames vazia e bitmap de swap
        /// dimensionado pela capacidade de `swap_disk`.
        pub fn new(
            config: VmConfig,
            palloc: Arc<dyn PhysAllocator>,
            swap_disk: Arc<dyn BlockDevice>,
        ) -> KResult<Self> {
            let swap = SwapTable::new(swap_disk)?;
            let frames = FrameTable::new(palloc.clone());

            let stats = swap.stats();
            log::info!(
                "mm: vm ok; swap slots total={} stack={:#x}..{:#x}",
                stats.total,
                config.stack_bottom(),
                config.stack_top
            );

            Ok(Self {
                config,
                palloc,
                frames,
                swap,
                counters: VmCounters::default(),
            })
        }

        pub fn config(&self) -> &VmConfig {
            &self.config
        }

        pub fn frames(&self) -> &FrameTable {
            &self.frames
        }

        pub fn swap(&self) -> &SwapTable {
            &self.swap
        }

        pub fn palloc(&self) -> &Arc<dyn PhysAllocator> {
            &self.palloc
        }

        pub fn stats(&self) -> VmStats {
            VmStats {
                faults: self.counters.faults.load(Ordering::Relaxed),
                evictions: self.counters.evictions.load(Ordering::Relaxed),
                cow_copies: self.counters.cow_copies.load(Ordering::Relaxed),
                stack_growths: self.counters.stack_growths.load(Ordering::Relaxed),
                resident_frames: self.frames.resident(),
                swap: self.swap.stats(),
            }
        }
    }
