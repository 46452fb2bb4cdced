//! Index structures: chunk and chunk-group metadata, the per-device index,
//! and the closing metadata section that seals a container.

use crate::error::Result;
use crate::format::{Chunk, DataType, MetaMarker, Timestamp, MAGIC_REVERSE};
use std::collections::BTreeMap;
use std::io::Write;

/// Location and summary of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    /// Measurement (column) identifier.
    pub measurement_id: String,
    /// Offset of the chunk's marker byte from file start.
    pub offset: u64,
    /// Data type of the values.
    pub data_type: DataType,
    /// Total number of values in the chunk.
    pub num_values: u64,
    /// Minimum timestamp in the chunk.
    pub start_time: Timestamp,
    /// Maximum timestamp in the chunk.
    pub end_time: Timestamp,
}

impl ChunkMetadata {
    /// Summarizes a chunk written (or parsed) at `offset`.
    pub fn from_chunk(chunk: &Chunk, offset: u64) -> Self {
        let (start_time, end_time) = chunk.time_range();
        Self {
            measurement_id: chunk.header.measurement_id.clone(),
            offset,
            data_type: chunk.header.data_type,
            num_values: chunk.num_values(),
            start_time,
            end_time,
        }
    }

    /// Writes the entry.
    ///
    /// Format:
    /// - measurement_id_len: u16 + measurement_id: UTF-8
    /// - offset: u64
    /// - data_type: u8
    /// - num_values: u64
    /// - start_time: i64
    /// - end_time: i64
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_str(writer, &self.measurement_id)?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&[self.data_type as u8])?;
        writer.write_all(&self.num_values.to_le_bytes())?;
        writer.write_all(&self.start_time.to_le_bytes())?;
        writer.write_all(&self.end_time.to_le_bytes())?;
        Ok(())
    }
}

/// A confirmed chunk group: one device's chunks and the byte range they span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGroupMetadata {
    /// Device the group belongs to.
    pub device_id: String,
    /// Offset of the group's first chunk marker.
    pub start_offset: u64,
    /// Offset just past the group's footer.
    pub end_offset: u64,
    /// Chunks in write order.
    pub chunks: Vec<ChunkMetadata>,
}

impl ChunkGroupMetadata {
    /// Total number of values across all chunks.
    pub fn num_values(&self) -> u64 {
        self.chunks.iter().map(|c| c.num_values).sum()
    }

    /// Looks up a chunk by measurement id.
    pub fn chunk(&self, measurement_id: &str) -> Option<&ChunkMetadata> {
        self.chunks.iter().find(|c| c.measurement_id == measurement_id)
    }

    /// Writes the group without its device id (the index groups by device).
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.start_offset.to_le_bytes())?;
        writer.write_all(&self.end_offset.to_le_bytes())?;
        writer.write_all(&(self.chunks.len() as u32).to_le_bytes())?;
        for chunk in &self.chunks {
            chunk.write_to(writer)?;
        }
        Ok(())
    }
}

/// Mapping from device id to its chunk groups in file order.
///
/// Rebuilt from scratch on every recovery pass; never persisted apart from the
/// container's own closing metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIndex {
    groups: BTreeMap<String, Vec<ChunkGroupMetadata>>,
}

impl DeviceIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a group to its device's sequence.
    pub fn insert(&mut self, group: ChunkGroupMetadata) {
        self.groups
            .entry(group.device_id.clone())
            .or_default()
            .push(group);
    }

    /// Appends every group of `other`, device by device.
    pub fn extend(&mut self, other: DeviceIndex) {
        for (device, groups) in other.groups {
            self.groups.entry(device).or_default().extend(groups);
        }
    }

    /// Returns the groups recorded for a device.
    pub fn get(&self, device_id: &str) -> Option<&[ChunkGroupMetadata]> {
        self.groups.get(device_id).map(Vec::as_slice)
    }

    /// Returns true if the device has at least one group.
    pub fn contains_device(&self, device_id: &str) -> bool {
        self.groups.contains_key(device_id)
    }

    /// Returns an iterator over devices and their groups, ordered by device id.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ChunkGroupMetadata])> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Returns an iterator over device ids.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Returns the number of devices.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if the index holds no devices.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Returns the number of groups across all devices.
    pub fn group_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Offset just past the last group in the index, if any.
    pub fn max_end_offset(&self) -> Option<u64> {
        self.groups
            .values()
            .flat_map(|groups| groups.iter().map(|g| g.end_offset))
            .max()
    }

    /// Writes the index body.
    ///
    /// Format:
    /// - device_count: u32
    /// - per device: device_id_len: u16 + device_id, group_count: u32, groups
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.groups.len() as u32).to_le_bytes())?;
        for (device, groups) in &self.groups {
            write_str(writer, device)?;
            writer.write_all(&(groups.len() as u32).to_le_bytes())?;
            for group in groups {
                group.write_to(writer)?;
            }
        }
        Ok(())
    }
}

/// Closing metadata written by an orderly shutdown.
///
/// ## Binary Layout
///
/// ```text
/// Size    Field
/// ----    -----
/// 1       marker (0x03)
/// N       device index body
/// 4       body_size (u32 LE)
/// 4       body_crc32 (u32 LE)
/// 4       reverse magic "FSTA"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    device_index: DeviceIndex,
}

impl FileMetadata {
    /// Creates closing metadata over an index.
    pub fn new(device_index: DeviceIndex) -> Self {
        Self { device_index }
    }

    /// Returns the authoritative device index.
    pub fn device_index(&self) -> &DeviceIndex {
        &self.device_index
    }

    /// Consumes the metadata, returning its device index.
    pub fn into_device_index(self) -> DeviceIndex {
        self.device_index
    }

    /// Writes marker, body and tail. Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let mut body = Vec::new();
        self.device_index.write_to(&mut body)?;

        MetaMarker::ClosingMetadata.write_to(writer)?;
        writer.write_all(&body)?;
        writer.write_all(&(body.len() as u32).to_le_bytes())?;
        writer.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        writer.write_all(&MAGIC_REVERSE)?;

        Ok(1 + body.len() as u64 + crate::format::CLOSING_TAIL_SIZE as u64)
    }
}

fn write_str<W: Write>(writer: &mut W, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    writer.write_all(&(bytes.len() as u16).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}
