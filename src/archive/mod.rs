//! Archive-header parsing for the multi-volume processors (spec §4.8
//! step 5): enough of RAR4/RAR5/7z to enumerate stored files, their byte
//! ranges within each volume, and detect the payload-obfuscation magic.
//! Decompression and full archive validation are out of scope — the core
//! only ever serves `store`-method (uncompressed) entries, since the whole
//! point of Usenet release packaging is to avoid re-compressing media.

pub mod rar;
pub mod sevenzip;

pub use rar::{detect_obfuscation, parse_rar_headers, RarFileEntry, RarFormat, RarHeaderInfo};
pub use sevenzip::{parse_sevenzip_header, SevenZipEntry, SevenZipHeaderInfo};
