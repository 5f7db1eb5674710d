//! Camada de storage usada pelo swap: dispositivos de bloco com granularidade
//! de setor.

pub mod block;
pub mod ramdisk;

pub use block::{BlockDevice, SECTOR_SIZE};
pub use ramdisk::RamDisk;
