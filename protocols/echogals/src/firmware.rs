// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Images of firmware for DSP and ASIC.
//!
//! The images are opaque binary resources retrieved at runtime via `OsSupport`. The module
//! includes identifiers of images, the parser of DSP code, and the store of images in file system.

use {
    super::*,
    glib::FileError,
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
};

/// Identifier of firmware image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FirmwareId {
    /// Resident loader for DSP56361.
    LoaderDsp,
    Gina24Dsp301,
    Gina24Dsp361,
    Gina24Asic301,
    Gina24Asic361,
    Layla20Dsp,
    Layla20Asic,
    Layla24Dsp,
    /// ASIC in PCI card of Layla24.
    Layla24Asic1,
    /// ASIC in external box of Layla24 for S/PDIF mode.
    Layla24Asic2S,
    /// ASIC in external box of Layla24 for ADAT mode.
    Layla24Asic2A,
    MonaDsp301,
    MonaDsp361,
    /// ASIC in PCI card of Mona with DSP56301 for single speed.
    MonaAsic301Rate48,
    /// ASIC in PCI card of Mona with DSP56301 for double speed.
    MonaAsic301Rate96,
    /// ASIC in PCI card of Mona with DSP56361 for single speed.
    MonaAsic361Rate48,
    /// ASIC in PCI card of Mona with DSP56361 for double speed.
    MonaAsic361Rate96,
    /// ASIC in external box of Mona.
    MonaAsic2,
    Echo3gDsp,
    Echo3gAsic,
}

impl FirmwareId {
    pub const ALL: &'static [Self] = &[
        Self::LoaderDsp,
        Self::Gina24Dsp301,
        Self::Gina24Dsp361,
        Self::Gina24Asic301,
        Self::Gina24Asic361,
        Self::Layla20Dsp,
        Self::Layla20Asic,
        Self::Layla24Dsp,
        Self::Layla24Asic1,
        Self::Layla24Asic2S,
        Self::Layla24Asic2A,
        Self::MonaDsp301,
        Self::MonaDsp361,
        Self::MonaAsic301Rate48,
        Self::MonaAsic301Rate96,
        Self::MonaAsic361Rate48,
        Self::MonaAsic361Rate96,
        Self::MonaAsic2,
        Self::Echo3gDsp,
        Self::Echo3gAsic,
    ];

    /// The name of file for the image.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::LoaderDsp => "loader_dsp.fw",
            Self::Gina24Dsp301 => "gina24_301_dsp.fw",
            Self::Gina24Dsp361 => "gina24_361_dsp.fw",
            Self::Gina24Asic301 => "gina24_301_asic.fw",
            Self::Gina24Asic361 => "gina24_361_asic.fw",
            Self::Layla20Dsp => "layla20_dsp.fw",
            Self::Layla20Asic => "layla20_asic.fw",
            Self::Layla24Dsp => "layla24_dsp.fw",
            Self::Layla24Asic1 => "layla24_1_asic.fw",
            Self::Layla24Asic2S => "layla24_2S_asic.fw",
            Self::Layla24Asic2A => "layla24_2A_asic.fw",
            Self::MonaDsp301 => "mona_301_dsp.fw",
            Self::MonaDsp361 => "mona_361_dsp.fw",
            Self::MonaAsic301Rate48 => "mona_301_1_asic_48.fw",
            Self::MonaAsic301Rate96 => "mona_301_1_asic_96.fw",
            Self::MonaAsic361Rate48 => "mona_361_1_asic_48.fw",
            Self::MonaAsic361Rate96 => "mona_361_1_asic_96.fw",
            Self::MonaAsic2 => "mona_2_asic.fw",
            Self::Echo3gDsp => "echo3g_dsp.fw",
            Self::Echo3gAsic => "3g_asic.fw",
        }
    }

    /// Whether the image is DSP code, or else ASIC bitstream.
    pub fn is_dsp_code(&self) -> bool {
        matches!(
            self,
            Self::LoaderDsp
                | Self::Gina24Dsp301
                | Self::Gina24Dsp361
                | Self::Layla20Dsp
                | Self::Layla24Dsp
                | Self::MonaDsp301
                | Self::MonaDsp361
                | Self::Echo3gDsp
        )
    }
}

/// The type of memory in DSP.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DspMemoryType {
    P,
    X,
    Y,
    Reserved(u16),
}

impl Default for DspMemoryType {
    fn default() -> Self {
        Self::P
    }
}

pub(crate) fn serialize_memory_type(mem_type: &DspMemoryType) -> u32 {
    match mem_type {
        DspMemoryType::P => 0,
        DspMemoryType::X => 1,
        DspMemoryType::Y => 2,
        DspMemoryType::Reserved(val) => *val as u32,
    }
}

fn deserialize_memory_type(mem_type: &mut DspMemoryType, val: u16) {
    *mem_type = match val {
        0 => DspMemoryType::P,
        1 => DspMemoryType::X,
        2 => DspMemoryType::Y,
        _ => DspMemoryType::Reserved(val),
    };
}

/// A block of DSP code to be placed at the address.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct DspCodeBlock {
    pub mem_type: DspMemoryType,
    /// 24 bit address.
    pub address: u32,
    /// 24 bit words.
    pub words: Vec<u32>,
}

/// DSP code parsed from image.
///
/// The image is an array of 16 bit little-endian words. The first word points to the first
/// section. Each section consists of its size, its type, the type of memory, the number of 24 bit
/// words, the 24 bit address, then the 24 bit words. The 24 bit values take two 16 bit words,
/// higher part first. The section type 4 or the count 0 terminates the sequence.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct DspCode {
    pub blocks: Vec<DspCodeBlock>,
}

const BLOCK_TYPE_END: u16 = 4;

impl DspCode {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() % 2 > 0 || raw.len() < 2 {
            let msg = format!("Unexpected length of DSP code: {}", raw.len());
            Err(status_error(EchoStatusError::BadFormat, &msg))?;
        }

        let code: Vec<u16> = raw
            .chunks_exact(2)
            .map(|frame| u16::from_le_bytes([frame[0], frame[1]]))
            .collect();

        let word = |index: usize| -> Result<u16, Error> {
            code.get(index).copied().ok_or_else(|| {
                let msg = format!("DSP code is truncated at {} words", index);
                status_error(EchoStatusError::BadFormat, &msg)
            })
        };
        let word24 = |index: usize| -> Result<u32, Error> {
            Ok(((word(index)? as u32) << 16) | (word(index + 1)? as u32))
        };

        let mut blocks = Vec::new();
        let mut index = code[0] as usize;

        loop {
            // Skip the size of section.
            index += 1;

            let block_type = word(index)?;
            if block_type == BLOCK_TYPE_END {
                break;
            }
            index += 1;

            let mut mem_type = DspMemoryType::default();
            deserialize_memory_type(&mut mem_type, word(index)?);
            index += 1;

            let count = word(index)? as usize;
            index += 1;
            if count == 0 {
                break;
            }

            let address = word24(index)?;
            index += 2;

            let words = (0..count)
                .map(|i| word24(index + i * 2))
                .collect::<Result<Vec<u32>, Error>>()?;
            index += count * 2;

            blocks.push(DspCodeBlock {
                mem_type,
                address,
                words,
            });
        }

        Ok(Self { blocks })
    }

    /// Generate image from blocks.
    pub fn build(&self) -> Vec<u8> {
        // The header section has just one word to point the first section.
        let mut code: Vec<u16> = vec![1];

        self.blocks.iter().for_each(|block| {
            let size = 6 + block.words.len() * 2;
            code.push(size as u16);
            code.push(0);
            code.push(serialize_memory_type(&block.mem_type) as u16);
            code.push(block.words.len() as u16);
            code.push((block.address >> 16) as u16);
            code.push(block.address as u16);
            block.words.iter().for_each(|&w| {
                code.push((w >> 16) as u16);
                code.push(w as u16);
            });
        });
        code.push(2);
        code.push(BLOCK_TYPE_END);

        code.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// The store of firmware images in a directory of file system. The retrieved images are cached.
#[derive(Debug)]
pub struct FirmwareDirectory {
    path: PathBuf,
    cache: Mutex<HashMap<FirmwareId, Arc<[u8]>>>,
}

impl FirmwareDirectory {
    pub fn new(path: &Path) -> Result<Self, Error> {
        if !path.is_dir() {
            let msg = format!("{} is not a directory", path.display());
            Err(Error::new(FileError::Notdir, &msg))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            cache: Default::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request(&self, id: FirmwareId) -> Result<Arc<[u8]>, Error> {
        let mut cache = self.cache.lock().map_err(|_| {
            let msg = "Cache of firmware is poisoned";
            Error::new(FileError::Failed, msg)
        })?;

        if let Some(image) = cache.get(&id) {
            return Ok(image.clone());
        }

        let path = self.path.join(id.file_name());
        let image: Arc<[u8]> = std::fs::read(&path)
            .map_err(|e| {
                let msg = format!("Fail to read {}: {}", path.display(), e);
                let code = match e.kind() {
                    std::io::ErrorKind::NotFound => FileError::Noent,
                    std::io::ErrorKind::PermissionDenied => FileError::Acces,
                    _ => FileError::Io,
                };
                Error::new(code, &msg)
            })?
            .into();

        if id.is_dsp_code() {
            DspCode::parse(&image)?;
        }

        cache.insert(id, image.clone());

        Ok(image)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dsp_code_parse() {
        let raw = [
            // Header.
            0x02, 0x00, 0xaa, 0xbb,
            // Section.
            0x0a, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x00,
            0x12, 0x00, 0x56, 0x34, 0xff, 0x00, 0xff, 0xff,
            // Terminator.
            0x02, 0x00, 0x04, 0x00,
        ];
        let code = DspCode::parse(&raw).unwrap();
        assert_eq!(
            code.blocks,
            vec![DspCodeBlock {
                mem_type: DspMemoryType::X,
                address: 0x000040,
                words: vec![0x123456, 0xffffff],
            }]
        );

        assert_eq!(DspCode::parse(&code.build()).unwrap(), code);
    }

    #[test]
    fn dsp_code_truncated() {
        let raw = [
            0x01, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x01, 0x00, 0x04, 0x00, 0x00, 0x00, 0x40, 0x00,
            0x12, 0x00,
        ];
        let err = DspCode::parse(&raw).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadFormat));

        let err = DspCode::parse(&[0x01]).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadFormat));
    }

    #[test]
    fn firmware_directory() {
        let dir = std::env::temp_dir().join(format!("echo-gals-fw-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let code = DspCode {
            blocks: vec![DspCodeBlock {
                mem_type: DspMemoryType::P,
                address: 0x100,
                words: vec![1, 2, 3],
            }],
        };
        std::fs::write(dir.join(FirmwareId::Layla20Dsp.file_name()), code.build()).unwrap();

        let store = FirmwareDirectory::new(&dir).unwrap();
        let image = store.request(FirmwareId::Layla20Dsp).unwrap();
        assert_eq!(DspCode::parse(&image).unwrap(), code);

        let err = store.request(FirmwareId::Layla20Asic).unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Noent));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
