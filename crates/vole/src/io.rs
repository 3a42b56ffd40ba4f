// Tensor serialization
//
// Layout on disk (all little-endian):
//
//   magic   4 bytes  "VOLE"
//   rank    u32
//   dims    u64 × rank
//   payload f32 × product(dims), row-major
//
// Only shape and data round-trip: no dtype, no versioning, no autograd state.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use vole_core::{Error, Result, Shape};

use crate::device::Device;
use crate::tensor::Tensor;

const MAGIC: &[u8; 4] = b"VOLE";
const MAX_RANK: u32 = 32;
/// Payload words read per step.
const CHUNK_WORDS: usize = 1 << 16;

impl Tensor {
    /// Serialize shape and row-major data.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let data = self.to_vec()?;
        writer.write_all(MAGIC)?;
        writer.write_all(&(self.rank() as u32).to_le_bytes())?;
        for &d in self.dims() {
            writer.write_all(&(d as u64).to_le_bytes())?;
        }
        let words: Vec<u32> = data.iter().map(|x| x.to_bits().to_le()).collect();
        writer.write_all(bytemuck::cast_slice(&words))?;
        Ok(())
    }

    /// Read a tensor written by [`Tensor::write_to`] onto `device`.
    pub fn read_from<R: Read>(reader: &mut R, device: &Device) -> Result<Tensor> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Format(format!("bad magic {magic:?}")));
        }

        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        let rank = u32::from_le_bytes(word);
        if rank > MAX_RANK {
            return Err(Error::Format(format!("rank {rank} exceeds {MAX_RANK}")));
        }

        let mut dims = Vec::with_capacity(rank as usize);
        let mut count = 1usize;
        for _ in 0..rank {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            let d = usize::try_from(u64::from_le_bytes(buf))
                .map_err(|_| Error::Format("dimension does not fit in usize".to_string()))?;
            if d == 0 {
                return Err(Error::Format("zero-sized dimension".to_string()));
            }
            count = count
                .checked_mul(d)
                .ok_or_else(|| Error::Format("element count overflows".to_string()))?;
            dims.push(d);
        }

        if count.checked_mul(4).is_none() {
            return Err(Error::Format(format!("payload of {count} f32 overflows")));
        }

        // The header is untrusted: grow the buffer only as data arrives.
        let mut data = Vec::with_capacity(count.min(CHUNK_WORDS));
        let mut words = vec![0u32; count.min(CHUNK_WORDS)];
        while data.len() < count {
            let chunk = &mut words[..(count - data.len()).min(CHUNK_WORDS)];
            reader.read_exact(bytemuck::cast_slice_mut(chunk))?;
            data.extend(chunk.iter().map(|&w| f32::from_bits(u32::from_le(w))));
        }
        Tensor::from_data(data, Shape::new(dims), device)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Tensor> {
        let mut reader = BufReader::new(File::open(path)?);
        Tensor::read_from(&mut reader, device)
    }
}
