use infuse_tdf::{TdfBuffer, TdfParser};

const T0: u64 = 1_400_000_000 << 16;

#[divan::bench(args = [1, 16, 64])]
fn bench_add_single(bencher: divan::Bencher, records: usize) {
    let payload = [0x5Au8; 6];
    bencher.bench(|| {
        let mut buf = TdfBuffer::new(1024);
        for i in 0..records {
            buf.add(11, 6, 1, T0 + i as u64 * 100, 0, divan::black_box(&payload))
                .unwrap();
        }
        buf
    });
}

#[divan::bench(args = [8, 32, 128])]
fn bench_add_time_array(bencher: divan::Bencher, count: usize) {
    let payload = vec![0xA5u8; 6 * count];
    bencher
        .counter(divan::counter::BytesCount::new(payload.len()))
        .bench(|| {
            let mut buf = TdfBuffer::new(1024);
            buf.add(11, 6, count as u8, T0, 655, divan::black_box(&payload))
                .unwrap()
        });
}

#[divan::bench]
fn bench_parse_block(bencher: divan::Bencher) {
    let mut buf = TdfBuffer::new(510);
    let mut i = 0u64;
    while buf.add(11, 6, 1, T0 + i * 100, 0, &[1; 6]).is_ok() {
        i += 1;
    }
    let raw = buf.as_bytes().to_vec();
    bencher.bench(|| TdfParser::new(divan::black_box(&raw)).count());
}

fn main() {
    divan::main();
}
