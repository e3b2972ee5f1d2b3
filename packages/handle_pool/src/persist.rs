//! The persistence boundary: encoders, decoders and the [`Persist`] trait.
//!
//! The encoding is a plain little-endian byte stream. It is not versioned and not meant as an
//! interchange format - it only guarantees that what one build of the crate saves, the same build
//! can load.

use crate::{Error, Result};

/// Selects how a save pass records pool entries and how a load pass applies them.
///
/// The mode is passed explicitly through every [`Persist`] call, so a value that contains its own
/// pools forwards the same mode to them and the whole tree is saved consistently.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SaveMode {
    /// Every entry is saved and loading replaces the whole pool.
    #[default]
    Full,

    /// Every entry is saved together with its change-tracking fields. Loading skips entries whose
    /// change-tracking fields show they are already up to date.
    Merge,
}

impl SaveMode {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Merge => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Full),
            1 => Ok(Self::Merge),
            other => Err(Error::malformed(format!("unknown save mode tag {other}"))),
        }
    }
}

/// Outcome of loading pool contents.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct LoadSummary {
    /// Entries that were not resident and have been created.
    pub added: usize,

    /// Resident entries whose contents were overwritten from the input.
    pub replaced: usize,

    /// Resident entries that were already up to date and were left untouched.
    pub skipped: usize,

    /// Resident entries that were absent from the input and have been removed.
    pub removed: usize,
}

/// Receives scalars and opaque byte blobs during a save pass.
pub trait Encoder {
    /// Writes a single byte.
    fn put_u8(&mut self, value: u8);

    /// Writes a 32-bit integer.
    fn put_u32(&mut self, value: u32);

    /// Writes a 64-bit integer.
    fn put_u64(&mut self, value: u64);

    /// Writes a byte blob whose length is recorded, so it can be read or skipped as a unit.
    fn put_bytes(&mut self, bytes: &[u8]);
}

/// Supplies scalars and opaque byte blobs during a load pass.
pub trait Decoder {
    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    fn take_u8(&mut self) -> Result<u8>;

    /// Reads a 32-bit integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    fn take_u32(&mut self) -> Result<u32>;

    /// Reads a 64-bit integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    fn take_u64(&mut self) -> Result<u64>;

    /// Reads a byte blob written by [`Encoder::put_bytes()`].
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted or the recorded length is not addressable.
    fn take_bytes(&mut self) -> Result<Vec<u8>>;

    /// Advances past a byte blob without returning it.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted or the recorded length is not addressable.
    fn skip_bytes(&mut self) -> Result<()> {
        self.take_bytes().map(drop)
    }
}

/// An [`Encoder`] that appends to an in-memory buffer.
///
/// # Examples
///
/// ```
/// use handle_pool::{ByteReader, ByteWriter, Persist, SaveMode};
///
/// let mut writer = ByteWriter::new();
/// "hello".to_string().save(&mut writer, SaveMode::Full);
///
/// let bytes = writer.into_bytes();
/// let mut reader = ByteReader::new(&bytes);
/// let text = String::load(&mut reader, SaveMode::Full).unwrap();
///
/// assert_eq!(text, "hello");
/// ```
#[derive(Clone, Debug, Default)]
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the writer, returning the bytes written.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Encoder for ByteWriter {
    fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u64(u64::try_from(bytes.len()).expect("usize always fits in u64"));
        self.bytes.extend_from_slice(bytes);
    }
}

/// A [`Decoder`] that reads from an in-memory buffer.
#[derive(Clone, Debug)]
pub struct ByteReader<'a> {
    input: &'a [u8],
}

impl<'a> ByteReader<'a> {
    /// Creates a reader over the given bytes.
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// The number of bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    /// Verifies that the entire input has been consumed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if bytes remain.
    pub fn finish(self) -> Result<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(Error::malformed(format!(
                "{} trailing bytes after the end of the value",
                self.input.len()
            )))
        }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.input.len() {
            return Err(Error::UnexpectedEnd {
                needed: count,
                remaining: self.input.len(),
            });
        }

        let (taken, rest) = self.input.split_at(count);
        self.input = rest;
        Ok(taken)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        Ok(bytes
            .try_into()
            .expect("take() returns exactly the requested number of bytes"))
    }

    fn take_blob_len(&mut self) -> Result<usize> {
        let len = self.take_u64()?;
        usize::try_from(len)
            .map_err(|_| Error::malformed(format!("blob length {len} is not addressable")))
    }
}

impl Decoder for ByteReader<'_> {
    fn take_u8(&mut self) -> Result<u8> {
        Ok(u8::from_le_bytes(self.take_array()?))
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_blob_len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn skip_bytes(&mut self) -> Result<()> {
        let len = self.take_blob_len()?;
        self.take(len).map(drop)
    }
}

/// A value that can be saved to an [`Encoder`] and restored from a [`Decoder`].
///
/// Pools require their items to implement this trait in order to be saved and loaded. The
/// [`SaveMode`] is forwarded unchanged to nested values; a value that owns a pool of its own
/// passes it on to that pool's `save()`/`load()` so the whole tree uses one mode.
pub trait Persist: Sized {
    /// Writes the value.
    fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode);

    /// Reads a new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the input does not describe a valid value.
    fn load(decoder: &mut dyn Decoder, mode: SaveMode) -> Result<Self>;

    /// Overwrites an existing value with one read from the input.
    ///
    /// Types that own pools override this to load in place, so that merge loads of nested pools
    /// can skip the entries that are already up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the input does not describe a valid value. The existing value is then
    /// left in an unspecified but valid state.
    fn load_into(&mut self, decoder: &mut dyn Decoder, mode: SaveMode) -> Result<()> {
        *self = Self::load(decoder, mode)?;
        Ok(())
    }
}

/// Saves a value into a standalone blob, so it can later be decoded or skipped as a unit.
pub(crate) fn encode_blob<T: Persist>(value: &T, mode: SaveMode) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    value.save(&mut writer, mode);
    writer.into_bytes()
}

pub(crate) fn decode_blob<T: Persist>(blob: &[u8], mode: SaveMode) -> Result<T> {
    let mut reader = ByteReader::new(blob);
    let value = T::load(&mut reader, mode)?;
    reader.finish()?;
    Ok(value)
}

pub(crate) fn decode_blob_into<T: Persist>(target: &mut T, blob: &[u8], mode: SaveMode) -> Result<()> {
    let mut reader = ByteReader::new(blob);
    target.load_into(&mut reader, mode)?;
    reader.finish()
}

macro_rules! persist_signed {
    ($($ty:ty => $unsigned:ty),*) => {
        $(
            impl Persist for $ty {
                fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode) {
                    <$unsigned>::from_le_bytes(self.to_le_bytes()).save(encoder, mode);
                }

                fn load(decoder: &mut dyn Decoder, mode: SaveMode) -> Result<Self> {
                    let unsigned = <$unsigned>::load(decoder, mode)?;
                    Ok(<$ty>::from_le_bytes(unsigned.to_le_bytes()))
                }
            }
        )*
    };
}

// Every integer is stored at its own width, signed ones as their two's complement bits.
persist_signed!(i8 => u8, i16 => u16, i32 => u32, i64 => u64);

impl Persist for u16 {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        for byte in self.to_le_bytes() {
            encoder.put_u8(byte);
        }
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        Ok(Self::from_le_bytes([decoder.take_u8()?, decoder.take_u8()?]))
    }
}

impl Persist for u32 {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_u32(*self);
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        decoder.take_u32()
    }
}

impl Persist for u8 {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_u8(*self);
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        decoder.take_u8()
    }
}

impl Persist for u64 {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_u64(*self);
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        decoder.take_u64()
    }
}

impl Persist for usize {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_u64(u64::try_from(*self).expect("usize always fits in u64"));
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        let raw = decoder.take_u64()?;
        Self::try_from(raw)
            .map_err(|_| Error::malformed(format!("{raw} is out of range for usize")))
    }
}

impl Persist for bool {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_u8(u8::from(*self));
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        match decoder.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::malformed(format!("{other} is not a valid bool"))),
        }
    }
}

impl Persist for f32 {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_u32(self.to_bits());
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        Ok(Self::from_bits(decoder.take_u32()?))
    }
}

impl Persist for f64 {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_u64(self.to_bits());
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        Ok(Self::from_bits(decoder.take_u64()?))
    }
}

impl Persist for String {
    fn save(&self, encoder: &mut dyn Encoder, _mode: SaveMode) {
        encoder.put_bytes(self.as_bytes());
    }

    fn load(decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
        Self::from_utf8(decoder.take_bytes()?)
            .map_err(|e| Error::malformed(format!("string is not valid UTF-8: {e}")))
    }
}

impl<T: Persist> Persist for Vec<T> {
    fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode) {
        self.len().save(encoder, mode);

        for item in self {
            item.save(encoder, mode);
        }
    }

    fn load(decoder: &mut dyn Decoder, mode: SaveMode) -> Result<Self> {
        let len = usize::load(decoder, mode)?;

        // The length is untrusted input, so we let the vector grow as items actually arrive.
        let mut items = Self::new();
        for _ in 0..len {
            items.push(T::load(decoder, mode)?);
        }

        Ok(items)
    }
}

impl<T: Persist> Persist for Option<T> {
    fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode) {
        match self {
            Some(value) => {
                encoder.put_u8(1);
                value.save(encoder, mode);
            }
            None => encoder.put_u8(0),
        }
    }

    fn load(decoder: &mut dyn Decoder, mode: SaveMode) -> Result<Self> {
        match decoder.take_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::load(decoder, mode)?)),
            other => Err(Error::malformed(format!("{other} is not a valid option tag"))),
        }
    }
}

impl<T: Persist> Persist for Box<T> {
    fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode) {
        (**self).save(encoder, mode);
    }

    fn load(decoder: &mut dyn Decoder, mode: SaveMode) -> Result<Self> {
        T::load(decoder, mode).map(Self::new)
    }

    fn load_into(&mut self, decoder: &mut dyn Decoder, mode: SaveMode) -> Result<()> {
        (**self).load_into(decoder, mode)
    }
}

impl<A: Persist, B: Persist> Persist for (A, B) {
    fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode) {
        self.0.save(encoder, mode);
        self.1.save(encoder, mode);
    }

    fn load(decoder: &mut dyn Decoder, mode: SaveMode) -> Result<Self> {
        Ok((A::load(decoder, mode)?, B::load(decoder, mode)?))
    }
}
