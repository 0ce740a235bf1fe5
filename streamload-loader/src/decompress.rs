use crate::{LoaderError, LoaderResult};
use std::io::Write;
use streamload_base::CompressionMethod;

/// Decompression backend used by the IO worker. Implementations must fill all of `dest`.
pub trait Decompressor: Send + Sync {
    fn decompress(
        &self,
        method: CompressionMethod,
        src: &[u8],
        dest: &mut [u8],
    ) -> LoaderResult<()>;
}

/// zlib via flate2, LZ4 block format via lz4_flex
#[derive(Default)]
pub struct StandardDecompressor;

impl Decompressor for StandardDecompressor {
    fn decompress(
        &self,
        method: CompressionMethod,
        src: &[u8],
        dest: &mut [u8],
    ) -> LoaderResult<()> {
        profiling::scope!("StandardDecompressor::decompress");
        match method {
            CompressionMethod::None => {
                if src.len() != dest.len() {
                    return Err(LoaderError::Decompression(format!(
                        "stored chunk is {} bytes, expected {}",
                        src.len(),
                        dest.len()
                    )));
                }
                dest.copy_from_slice(src);
                Ok(())
            }
            CompressionMethod::Zlib => {
                let mut inflater = flate2::Decompress::new(true);
                let status = inflater
                    .decompress(src, dest, flate2::FlushDecompress::Finish)
                    .map_err(|e| LoaderError::Decompression(e.to_string()))?;
                if status != flate2::Status::StreamEnd || inflater.total_out() as usize != dest.len()
                {
                    return Err(LoaderError::Decompression(format!(
                        "zlib produced {} bytes, expected {}",
                        inflater.total_out(),
                        dest.len()
                    )));
                }
                Ok(())
            }
            CompressionMethod::Lz4 => {
                let written = lz4_flex::block::decompress_into(src, dest)
                    .map_err(|e| LoaderError::Decompression(e.to_string()))?;
                if written != dest.len() {
                    return Err(LoaderError::Decompression(format!(
                        "lz4 produced {} bytes, expected {}",
                        written,
                        dest.len()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Producer side of `StandardDecompressor`, used when writing packages
pub fn compress_block(
    method: CompressionMethod,
    data: &[u8],
) -> LoaderResult<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionMethod::Lz4 => Ok(lz4_flex::block::compress(data)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..5000u32).map(|x| (x % 251) as u8).collect()
    }

    #[test]
    fn zlib_and_lz4_fill_destination() {
        let data = sample();
        for method in [CompressionMethod::Zlib, CompressionMethod::Lz4] {
            let compressed = compress_block(method, &data).unwrap();
            let mut dest = vec![0u8; data.len()];
            StandardDecompressor
                .decompress(method, &compressed, &mut dest)
                .unwrap();
            assert_eq!(dest, data);
        }
    }

    #[test]
    fn short_output_is_an_error() {
        let data = sample();
        let compressed = compress_block(CompressionMethod::Zlib, &data).unwrap();
        let mut dest = vec![0u8; data.len() + 10];
        assert!(StandardDecompressor
            .decompress(CompressionMethod::Zlib, &compressed, &mut dest)
            .is_err());
    }
}
