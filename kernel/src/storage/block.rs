    use crate::util::{KError, KResult};

    /// Tamanho de setor assumido pelo swap.
    pub const SECTOR_SIZE: usize = 512;

    /// Interface genérica de dispositivo de bloco (disco de swap, ramdisk).
    pub trait BlockDevice: Send + Sync {
        /// Tamanho de bloco (normalmente 512).
        fn block_size(&self) -> u32;

        /// Número total de blocos.
        fn num_blocks(&self) -> u64;

        /// Lê `count` blocos a partir de `lba` para `out`.
        /// `out.len()` deve ser `count * block_size`.
        fn read_blocks(&self, lba: u64, count: u32, out: &mut [u8]) -> KResult<()>;

        /// Escreve `count` blocos a partir de `lba` de `data`.
        fn write_blocks(&self, lba: u64, count: u32, data: &[u8]) -> KResult<()>;
    }

    pub fn check_io_args(block_size: u32, count: u32, buf_len: usize) -> KResult<()> {
        let expected = (block_size as usize)
            .checked_mul(count as usize)
            .ok_or(KError::Invalid)?;
        if expected != buf_len {
            return Err(KError::Invalid);
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_check_io_args() {
            assert_eq!(check_io_args(512, 2, 1024), Ok(()));
            assert_eq!(check_io_args(512, 2, 1000), Err(KError::Invalid));
            assert_eq!(check_io_args(u32::MAX, u32::MAX, 0), Err(KError::Invalid));
        }
    }
