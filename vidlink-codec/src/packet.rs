use bytes::Bytes;

/// One encoder output unit. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    data: Bytes,
    timestamp: i64,
    is_key: bool,
}

impl EncodedPacket {
    pub fn new(data: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            data: data.into(),
            timestamp,
            is_key: false,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<&ffmpeg_next::codec::packet::Packet> for EncodedPacket {
    fn from(packet: &ffmpeg_next::codec::packet::Packet) -> Self {
        Self {
            data: packet
                .data()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            timestamp: packet.pts().unwrap_or(0),
            is_key: packet.is_key(),
        }
    }
}
