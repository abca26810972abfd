#![feature(test)]
extern crate test;
use bytes::BytesMut;
use craftrelay::{ids, Packet, PacketCodec};
use test::{black_box, Bencher};
use tokio_util::codec::{Decoder, Encoder};

fn frames(num: usize, payload: usize) -> BytesMut {
    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::new();
    let packet = Packet::new(0x20, vec![0x5a; payload].as_slice());
    for _ in 0..num {
        codec.encode(&packet, &mut buf).unwrap();
    }
    buf
}

fn decode_x(b: &mut Bencher, num: usize, payload: usize) {
    let src = frames(num, payload);
    let mut codec = PacketCodec::new();
    b.iter(|| {
        let mut buf = src.clone();
        let mut n = 0;
        while let Some(packet) = codec.decode(&mut buf).unwrap() {
            black_box(packet);
            n += 1;
        }
        assert_eq!(n, num);
    });
}

fn encode_x(b: &mut Bencher, num: usize, payload: usize) {
    let packet = Packet::new(0x20, vec![0x5a; payload].as_slice());
    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::with_capacity(num * (payload + 8));
    b.iter(|| {
        buf.clear();
        for _ in 0..num {
            codec.encode(&packet, &mut buf).unwrap();
        }
        black_box(buf.len());
    });
}

#[bench]
fn decode_small_x1000(b: &mut Bencher) {
    decode_x(b, 1000, 16);
}

#[bench]
fn decode_large_x100(b: &mut Bencher) {
    decode_x(b, 100, 32 * 1024);
}

#[bench]
fn encode_small_x1000(b: &mut Bencher) {
    encode_x(b, 1000, 16);
}

#[bench]
fn encode_large_x100(b: &mut Bencher) {
    encode_x(b, 100, 32 * 1024);
}

#[bench]
fn read_chat_fields(b: &mut Bencher) {
    let packet = craftrelay::chat_packet("the quick brown fox jumps over the lazy dog");
    assert_eq!(packet.id, ids::CHAT_CLIENTBOUND);
    b.iter(|| {
        let mut r = packet.reader();
        black_box(r.get_string().unwrap());
        black_box(r.get_i8().unwrap());
        black_box(r.get_uuid().unwrap());
    });
}
