//! Minimal PE header and export-table handling.
//!
//! Only what kernel discovery and export resolution need: header
//! validation, the export data directory, and the export name table. Both
//! 32-bit and 64-bit images are handled; the variant is picked from the
//! optional-header magic.

use object::{
    LittleEndian as LE,
    pe::{
        IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE,
        ImageDataDirectory, ImageDosHeader, ImageExportDirectory, ImageNtHeaders32,
        ImageNtHeaders64, IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC,
    },
    read::{
        ReadRef as _,
        pe::{ExportTarget, ExportTable, ImageNtHeaders, ImageOptionalHeader, optional_header_magic},
    },
};

/// An error while parsing a PE image.
#[derive(thiserror::Error, Debug)]
pub enum PeError {
    /// The DOS header is missing or misaligned.
    #[error("invalid DOS header")]
    InvalidDosHeader,

    /// The NT headers are missing, misaligned or carry a wrong signature.
    #[error("invalid NT headers")]
    InvalidNtHeaders,

    /// The optional header is truncated or carries a wrong magic.
    #[error("invalid optional header")]
    InvalidOptionalHeader,

    /// The image has no export directory.
    #[error("no export directory")]
    NoExportDirectory,

    /// The export table is malformed.
    #[error("invalid export table")]
    InvalidExportTable,
}

/// One exported symbol: name and RVA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeExport {
    /// The export name.
    pub name: String,

    /// The RVA of the exported address.
    pub rva: u64,
}

/// Parsed PE headers, reduced to the fields introspection needs.
#[derive(Debug, Clone, Copy)]
pub struct PeHeaders {
    /// Whether the image is 64-bit (`PE32+`).
    pub is_64bit: bool,

    /// Size of the mapped image in bytes.
    pub size_of_image: u32,

    /// RVA and size of the export data directory, when present.
    pub export_directory: Option<(u32, u32)>,
}

impl PeHeaders {
    /// Parses the headers from the first page of an image.
    pub fn parse(data: &[u8]) -> Result<Self, PeError> {
        match optional_header_magic(data) {
            Ok(IMAGE_NT_OPTIONAL_HDR32_MAGIC) => Self::parse_generic::<ImageNtHeaders32>(data, false),
            Ok(IMAGE_NT_OPTIONAL_HDR64_MAGIC) => Self::parse_generic::<ImageNtHeaders64>(data, true),
            _ => Err(PeError::InvalidOptionalHeader),
        }
    }

    fn parse_generic<Pe>(data: &[u8], is_64bit: bool) -> Result<Self, PeError>
    where
        Pe: ImageNtHeaders,
    {
        let dos_header = data
            .read_at::<ImageDosHeader>(0)
            .map_err(|_| PeError::InvalidDosHeader)?;

        if dos_header.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
            return Err(PeError::InvalidDosHeader);
        }

        let mut offset = dos_header.nt_headers_offset() as u64;
        let nt_headers = data
            .read::<Pe>(&mut offset)
            .map_err(|_| PeError::InvalidNtHeaders)?;

        if nt_headers.signature() != IMAGE_NT_SIGNATURE {
            return Err(PeError::InvalidNtHeaders);
        }
        if !nt_headers.is_valid_optional_magic() {
            return Err(PeError::InvalidOptionalHeader);
        }

        let optional_data_size =
            u64::from(nt_headers.file_header().size_of_optional_header.get(LE))
                .checked_sub(size_of::<Pe::ImageOptionalHeader>() as u64)
                .ok_or(PeError::InvalidOptionalHeader)?;

        let optional_data = data
            .read_bytes(&mut offset, optional_data_size)
            .map_err(|_| PeError::InvalidOptionalHeader)?;

        let data_directories: &[ImageDataDirectory] = optional_data
            .read_slice_at(
                0,
                nt_headers.optional_header().number_of_rva_and_sizes() as usize,
            )
            .map_err(|_| PeError::InvalidOptionalHeader)?;

        let export_directory = data_directories
            .get(IMAGE_DIRECTORY_ENTRY_EXPORT)
            .map(|entry| (entry.virtual_address.get(LE), entry.size.get(LE)))
            .filter(|&(rva, size)| rva != 0 && size != 0);

        Ok(Self {
            is_64bit,
            size_of_image: nt_headers.optional_header().size_of_image(),
            export_directory,
        })
    }
}

/// Reads the `Name` RVA out of a raw export directory blob.
pub fn export_directory_name_rva(blob: &[u8]) -> Result<u32, PeError> {
    let (directory, _) = object::pod::from_bytes::<ImageExportDirectory>(
        blob.get(..size_of::<ImageExportDirectory>())
            .ok_or(PeError::InvalidExportTable)?,
    )
    .map_err(|_| PeError::InvalidExportTable)?;

    Ok(directory.name.get(LE))
}

/// Parses the export table out of the export directory blob.
///
/// `blob` must cover the whole export data directory and `base_rva` is the
/// directory's RVA within the image (the table's internal pointers are
/// image-relative).
pub fn parse_exports(blob: &[u8], base_rva: u32) -> Result<Vec<PeExport>, PeError> {
    let table = ExportTable::parse(blob, base_rva).map_err(|_| PeError::InvalidExportTable)?;

    let exports = table
        .exports()
        .map_err(|_| PeError::InvalidExportTable)?
        .into_iter()
        .filter_map(|export| match export.target {
            ExportTarget::Address(address) => Some(PeExport {
                name: String::from_utf8_lossy(export.name?).to_string(),
                rva: address as u64,
            }),
            _ => None,
        })
        .collect();

    Ok(exports)
}
