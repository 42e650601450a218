//! Binary memory images: a file of big-endian words, loaded verbatim at a word
//! address of real memory.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{self as C, Address, Word};
use crate::runtime::{MemoryError, RealMemory};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is empty")]
    Empty { path: Utf8PathBuf },

    #[error("{words} words at X'{origin:X}' do not fit in installed memory")]
    TooLarge {
        origin: Address,
        words: usize,
        #[source]
        source: MemoryError,
    },
}

/// Split raw bytes into big-endian words, padding a trailing partial word with zeros
#[must_use]
pub fn words_from_bytes(bytes: &[u8]) -> Vec<Word> {
    bytes
        .chunks(C::WORD_BYTES as usize)
        .map(|chunk| {
            let mut word = [0; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            Word::from_be_bytes(word)
        })
        .collect()
}

/// Read an image file as words
///
/// # Errors
///
/// Fails if the file cannot be read or is empty.
pub fn read_image(path: &Utf8Path) -> Result<Vec<Word>, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Read {
        path: path.to_owned(),
        source,
    })?;

    if bytes.is_empty() {
        return Err(LoadError::Empty {
            path: path.to_owned(),
        });
    }

    if bytes.len() % C::WORD_BYTES as usize != 0 {
        warn!(
            %path,
            length = bytes.len(),
            "Image is not a whole number of words, padding with zeros"
        );
    }

    Ok(words_from_bytes(&bytes))
}

/// Load an image into real memory at a word address, returning the number of
/// words written. Write locks are ignored.
///
/// # Errors
///
/// Fails if the file cannot be read or runs past installed memory.
#[tracing::instrument(skip(memory))]
pub fn load_image(
    memory: &RealMemory,
    path: &Utf8Path,
    origin: Address,
) -> Result<usize, LoadError> {
    let words = read_image(path)?;
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_be_bytes()).collect();

    memory
        .write_bytes(origin * C::WORD_BYTES, &bytes)
        .map_err(|source| LoadError::TooLarge {
            origin,
            words: words.len(),
            source,
        })?;

    debug!(words = words.len(), "Image loaded");
    Ok(words.len())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Write `bytes` to a fresh file in the temporary directory
    fn image_file(name: &str, bytes: &[u8]) -> Utf8PathBuf {
        let path = std::env::temp_dir().join(format!("sigma-{}-{name}.img", std::process::id()));
        std::fs::write(&path, bytes).unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[test]
    fn words_from_bytes_test() {
        assert_eq!(
            words_from_bytes(&[0x22, 0x30, 0x00, 0x05, 0xAB]),
            vec![0x2230_0005, 0xAB00_0000]
        );
        assert!(words_from_bytes(&[]).is_empty());
    }

    #[test]
    fn load_image_test() {
        let path = image_file("load", &[0x22, 0x30, 0x00, 0x05, 0x2E, 0x00, 0x00, 0x00]);
        let memory = RealMemory::new(1);

        assert_eq!(load_image(&memory, &path, 0x100).unwrap(), 2);
        assert_eq!(memory.load_word(0x400).unwrap(), 0x2230_0005);
        assert_eq!(memory.load_word(0x404).unwrap(), 0x2E00_0000);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_errors_test() {
        let memory = RealMemory::new(1);

        let missing = Utf8PathBuf::from("/nonexistent/sigma.img");
        assert!(matches!(
            load_image(&memory, &missing, 0),
            Err(LoadError::Read { .. })
        ));

        let empty = image_file("empty", &[]);
        assert!(matches!(
            load_image(&memory, &empty, 0),
            Err(LoadError::Empty { .. })
        ));
        std::fs::remove_file(&empty).unwrap();

        // One page is 512 words
        let large = image_file("large", &[0; 8]);
        assert!(matches!(
            load_image(&memory, &large, 511),
            Err(LoadError::TooLarge { words: 2, .. })
        ));
        std::fs::remove_file(&large).unwrap();
    }
}
