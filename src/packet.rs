use bytes::{Buf, BufMut, BytesMut};
use paste::paste;
use std::fmt;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// 三字节长度前缀能表示的最大帧长度。
pub const MAX_PACKET_SIZE: usize = 2_097_151;
pub const MAX_STRING_LEN: usize = 32_767;

const MAX_VARINT_LEN: usize = 5;
const MAX_LENGTH_LEN: usize = 3;

/// 所支持协议版本的常用数据包 id。
pub mod ids {
    /// 发往服务器，握手阶段。
    pub const HANDSHAKE: i32 = 0x00;
    /// 发往客户端，登录阶段。
    pub const LOGIN_SUCCESS: i32 = 0x02;
    /// 发往客户端，登录阶段。
    pub const SET_COMPRESSION: i32 = 0x03;
    pub const CHAT_CLIENTBOUND: i32 = 0x0E;
    pub const KICK_DISCONNECT: i32 = 0x19;
    pub const JOIN_GAME: i32 = 0x24;
    pub const UPDATE_HEALTH: i32 = 0x49;
    pub const UPDATE_TIME: i32 = 0x4E;
}

/// 一个代表数据包异常的枚举。
#[derive(Debug)]
pub enum PacketError {
    VarIntTooLong,
    FrameTooLarge(usize, usize),
    PacketTooLarge(usize, usize),
    EmptyFrame,
    MalformedId,
    NegativeLength(i32),
    NotEnoughData(usize, usize),
    InvalidUtf8,
    StringTooLong(usize, usize),
    Closed,
    Io(std::io::Error),
}

impl PacketError {
    /// 数据流无法继续读写时返回 `true`。
    ///
    /// 帧格式错误会使输入失去同步，与正常关闭一样结束数据流；
    /// 已经完整读取但无法解析的帧只影响该数据包本身。
    pub fn is_fatal(&self) -> bool {
        match self {
            PacketError::Closed | PacketError::VarIntTooLong | PacketError::FrameTooLarge(..) => {
                true
            }
            PacketError::Io(err) => !matches!(
                err.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// 数据流正常结束时返回 `true`。
    pub fn is_closed(&self) -> bool {
        match self {
            PacketError::Closed => true,
            PacketError::Io(err) => err.kind() == ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

impl From<std::io::Error> for PacketError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::VarIntTooLong => write!(f, "VarInt Too Long"),
            PacketError::FrameTooLarge(cur, max) => {
                write!(f, "Frame Too Large({} > {})", cur, max)
            }
            PacketError::PacketTooLarge(cur, max) => {
                write!(f, "Packet Too Large({} > {})", cur, max)
            }
            PacketError::EmptyFrame => write!(f, "Empty Frame"),
            PacketError::MalformedId => write!(f, "Malformed Packet Id"),
            PacketError::NegativeLength(len) => write!(f, "Negative Length({})", len),
            PacketError::NotEnoughData(cur, min) => write!(f, "Not Enough Data({} < {})", cur, min),
            PacketError::InvalidUtf8 => write!(f, "Invalid Utf8"),
            PacketError::StringTooLong(cur, max) => {
                write!(f, "String Too Long({} > {})", cur, max)
            }
            PacketError::Closed => write!(f, "Closed"),
            PacketError::Io(err) => write!(f, "Io({})", err),
        }
    }
}

impl std::error::Error for PacketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PacketError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// 返回 `val` 编码为 VarInt 后的字节数。
pub fn varint_len(val: i32) -> usize {
    let mut v = val as u32;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// 将 `val` 以 VarInt 形式写入 `buf`。
pub fn put_varint<B: BufMut>(buf: &mut B, val: i32) {
    let mut v = val as u32;
    loop {
        if v & !0x7f == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v & 0x7f) as u8 | 0x80);
        v >>= 7;
    }
}

// Ok(None) 表示需要更多数据
fn peek_varint(src: &[u8], max_len: usize) -> Result<Option<(i32, usize)>, PacketError> {
    let mut val = 0u32;
    for (i, b) in src.iter().take(max_len).enumerate() {
        val |= ((b & 0x7f) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((val as i32, i + 1)));
        }
    }
    if src.len() >= max_len {
        Err(PacketError::VarIntTooLong)
    } else {
        Ok(None)
    }
}

/// 一个代表数据包的类型。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: BytesMut,
}

impl Packet {
    pub fn new<T: Into<BytesMut>>(id: i32, data: T) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// 以指定 id 开始构造数据包。
    pub fn builder(id: i32) -> PacketBuilder {
        PacketBuilder::new(id)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 返回负载字段的读取器。
    pub fn reader(&self) -> FieldReader<'_> {
        FieldReader::new(self.as_bytes())
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data[..]
    }
}

macro_rules! reader_impl_type {
    ($($t:ty),*) => {
        paste! {
            $(
                #[doc = "读取一个大端序的 `" $t "` 字段。"]
                pub fn [<get_ $t>](&mut self) -> Result<$t, PacketError> {
                    self.need(std::mem::size_of::<$t>())?;
                    Ok(self.data.[<get_ $t>]())
                }
            )*
        }
    };
}

/// 一个代表数据包字段读取器的类型。
pub struct FieldReader<'a> {
    data: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn need(&self, len: usize) -> Result<(), PacketError> {
        if self.data.len() < len {
            Err(PacketError::NotEnoughData(self.data.len(), len))
        } else {
            Ok(())
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// 返回尚未读取的字节。
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    pub fn get_varint(&mut self) -> Result<i32, PacketError> {
        match peek_varint(self.data, MAX_VARINT_LEN)? {
            Some((val, n)) => {
                self.data.advance(n);
                Ok(val)
            }
            None => Err(PacketError::NotEnoughData(
                self.data.len(),
                self.data.len() + 1,
            )),
        }
    }

    pub fn get_bool(&mut self) -> Result<bool, PacketError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_string(&mut self) -> Result<String, PacketError> {
        let len = self.get_varint()?;
        let len = usize::try_from(len).map_err(|_| PacketError::NegativeLength(len))?;
        if len > MAX_STRING_LEN * 4 {
            return Err(PacketError::StringTooLong(len, MAX_STRING_LEN * 4));
        }
        self.need(len)?;
        let (head, tail) = self.data.split_at(len);
        let s = std::str::from_utf8(head).map_err(|_| PacketError::InvalidUtf8)?;
        self.data = tail;
        Ok(s.to_owned())
    }

    pub fn get_uuid(&mut self) -> Result<u128, PacketError> {
        self.need(16)?;
        Ok(self.data.get_u128())
    }

    reader_impl_type!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);
}

macro_rules! builder_impl_type {
    ($($t:ty),*) => {
        paste! {
            $(
                #[doc = "写入一个大端序的 `" $t "` 字段。"]
                pub fn [<put_ $t>](mut self, val: $t) -> Self {
                    self.data.[<put_ $t>](val);
                    self
                }
            )*
        }
    };
}

/// 一个代表数据包构造器的类型。
pub struct PacketBuilder {
    id: i32,
    data: BytesMut,
}

impl PacketBuilder {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            data: BytesMut::new(),
        }
    }

    pub fn put_varint(mut self, val: i32) -> Self {
        put_varint(&mut self.data, val);
        self
    }

    pub fn put_bool(mut self, val: bool) -> Self {
        self.data.put_u8(val as u8);
        self
    }

    pub fn put_string(mut self, val: &str) -> Self {
        put_varint(&mut self.data, val.len() as i32);
        self.data.put_slice(val.as_bytes());
        self
    }

    pub fn put_uuid(mut self, val: u128) -> Self {
        self.data.put_u128(val);
        self
    }

    pub fn put_slice(mut self, val: &[u8]) -> Self {
        self.data.put_slice(val);
        self
    }

    builder_impl_type!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

    pub fn build(self) -> Packet {
        Packet {
            id: self.id,
            data: self.data,
        }
    }
}

/// 一个代表数据包编解码器的类型，帧格式为 `VarInt(len) VarInt(id) payload`。
///
/// 解码时接受带填充（非规范）的长度和 id VarInt，编码时总是写出最短形式。
/// 规范帧按字节原样转发，带填充的帧转发后会被规范化。
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    max_size: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size: max_size.min(MAX_PACKET_SIZE),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (length, n) = match peek_varint(src, MAX_LENGTH_LEN)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let length = length as usize;
        if length > self.max_size {
            return Err(PacketError::FrameTooLarge(length, self.max_size));
        }
        if length == 0 {
            src.advance(n);
            return Err(PacketError::EmptyFrame);
        }
        if src.len() < n + length {
            src.reserve(n + length - src.len());
            return Ok(None);
        }
        src.advance(n);
        let mut body = src.split_to(length);
        match peek_varint(&body, MAX_VARINT_LEN) {
            Ok(Some((id, m))) => {
                body.advance(m);
                Ok(Some(Packet { id, data: body }))
            }
            _ => Err(PacketError::MalformedId),
        }
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = varint_len(item.id) + item.data.len();
        if length > self.max_size {
            return Err(PacketError::PacketTooLarge(length, self.max_size));
        }
        dst.reserve(varint_len(length as i32) + length);
        put_varint(dst, length as i32);
        put_varint(dst, item.id);
        dst.put_slice(&item.data);
        Ok(())
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Packet>::encode(self, &item, dst)
    }
}

/// 一个代表数据包读取器的类型。
///
/// 与 `FramedRead` 不同，遇到非致命错误后仍可继续读取，
/// 单个损坏的帧会被跳过。
pub struct PacketReader<R> {
    inner: R,
    codec: PacketCodec,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_codec(inner, PacketCodec::new())
    }

    pub fn with_codec(inner: R, codec: PacketCodec) -> Self {
        Self {
            inner,
            codec,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// 读取下一个数据包，数据流结束时返回 `PacketError::Closed`。
    ///
    /// 可安全取消：已收到的字节会保留在缓冲区中。
    pub async fn read_packet(&mut self) -> Result<Packet, PacketError> {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buf)? {
                return Ok(packet);
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(PacketError::Closed);
            }
        }
    }
}

/// 一个代表数据包写入器的类型。
pub struct PacketWriter<W> {
    inner: W,
    codec: PacketCodec,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_codec(inner, PacketCodec::new())
    }

    pub fn with_codec(inner: W, codec: PacketCodec) -> Self {
        Self {
            inner,
            codec,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), PacketError> {
        self.buf.clear();
        self.codec.encode(packet, &mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: i32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        PacketCodec::new()
            .encode(&Packet::new(id, payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn varint_encoding() {
        let cases: [(i32, &[u8]); 6] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (2_097_151, &[0xff, 0xff, 0x7f]),
            (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
        ];
        for (val, bytes) in cases {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, val);
            assert_eq!(&buf[..], bytes);
            assert_eq!(varint_len(val), bytes.len());
            assert_eq!(FieldReader::new(bytes).get_varint().unwrap(), val);
        }
    }

    #[test]
    fn encode_layout() {
        let buf = frame(ids::UPDATE_TIME, &[1, 2, 3]);
        assert_eq!(&buf[..], &[0x04, 0x4e, 1, 2, 3]);
    }

    #[test]
    fn decode_waits_for_whole_frame() {
        let full = frame(0x21, b"hello world");
        let mut codec = PacketCodec::new();
        let mut src = BytesMut::from(&full[..4]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&full[4..]);
        let packet = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(packet.id, 0x21);
        assert_eq!(packet.as_bytes(), b"hello world");
        assert!(src.is_empty());
    }

    #[test]
    fn decode_skips_frame_with_bad_id() {
        let mut src = BytesMut::from(&[0x02, 0x80, 0x80][..]);
        src.extend_from_slice(&frame(0x05, b"ok"));
        let mut codec = PacketCodec::new();
        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, PacketError::MalformedId));
        assert!(!err.is_fatal());
        let packet = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(packet.id, 0x05);
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut src = BytesMut::from(&[0xff, 0xff, 0xff, 0x01][..]);
        let err = PacketCodec::new().decode(&mut src).unwrap_err();
        assert!(matches!(err, PacketError::VarIntTooLong));
        assert!(err.is_fatal());

        let mut src = frame(0x01, &[0u8; 64]);
        let err = PacketCodec::with_max_size(16).decode(&mut src).unwrap_err();
        assert!(matches!(err, PacketError::FrameTooLarge(65, 16)));
        assert!(err.is_fatal());
    }

    #[test]
    fn fields_round_trip_through_builder() {
        let packet = Packet::builder(ids::HANDSHAKE)
            .put_varint(754)
            .put_string("localhost")
            .put_u16(25565)
            .put_varint(2)
            .build();
        let mut r = packet.reader();
        assert_eq!(r.get_varint().unwrap(), 754);
        assert_eq!(r.get_string().unwrap(), "localhost");
        assert_eq!(r.get_u16().unwrap(), 25565);
        assert_eq!(r.get_varint().unwrap(), 2);
        assert_eq!(r.remaining(), 0);
        assert!(matches!(r.get_f32(), Err(PacketError::NotEnoughData(0, 4))));
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let data = [0x02, 0xc3, 0x28];
        assert!(matches!(
            FieldReader::new(&data).get_string(),
            Err(PacketError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn reader_continues_after_bad_frame() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&frame(0x01, b"a"));
        wire.extend_from_slice(&[0x00]);
        wire.extend_from_slice(&frame(0x02, b"b"));
        let mut reader = PacketReader::new(&wire[..]);
        assert_eq!(reader.read_packet().await.unwrap().id, 0x01);
        let err = reader.read_packet().await.unwrap_err();
        assert!(matches!(err, PacketError::EmptyFrame));
        assert_eq!(reader.read_packet().await.unwrap().id, 0x02);
        let err = reader.read_packet().await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn writer_emits_frames() {
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            writer
                .write_packet(&Packet::new(0x0e, &b"xy"[..]))
                .await
                .unwrap();
        }
        assert_eq!(out, vec![0x03, 0x0e, b'x', b'y']);
    }

    #[test]
    fn padded_varints_are_normalised() {
        let mut codec = PacketCodec::new();
        // length 4 padded to two bytes, id 1 padded to two bytes
        let mut src = BytesMut::from(&[0x84, 0x00, 0x81, 0x00, 0xaa, 0xbb][..]);
        let packet = codec.decode(&mut src).unwrap().unwrap();
        assert!(src.is_empty());
        assert_eq!(packet, Packet::new(0x01, &[0xaa, 0xbb][..]));

        let mut dst = BytesMut::new();
        codec.encode(&packet, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x03, 0x01, 0xaa, 0xbb][..]);
    }
}
