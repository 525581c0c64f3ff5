use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sealpack::{
    ArchiveOptions, ArchiveReader, ArchiveWriter, Argon2Provider, CodecId, Integrity, KdfParams,
    KeysetProvider, PasswordHash,
};
use std::io::Cursor;
use tempfile::NamedTempFile;

fn bench_hash() -> PasswordHash {
    Argon2Provider::new(KdfParams { mem_cost_kib: 256, time_cost: 1, parallelism: 1 })
        .hash("bench")
        .unwrap()
}

fn bench_pack(c: &mut Criterion) {
    let data = vec![42u8; 1024 * 1024];
    let hash = bench_hash();

    for (label, compression) in [("none", CodecId::None), ("zstd", CodecId::Zstd), ("lz4", CodecId::Lz4)] {
        c.bench_function(&format!("pack_1mb_{label}_mac"), |b| {
            b.iter(|| {
                let options = ArchiveOptions { compression, ..Default::default() };
                let mut writer = ArchiveWriter::new(Cursor::new(Vec::new()), &hash, options).unwrap();
                writer.add_entry("bench.bin", black_box(&data)).unwrap();
                writer.close().unwrap();
            })
        });
    }

    c.bench_function("pack_1mb_plain_zstd", |b| {
        b.iter(|| {
            let mut writer = ArchiveWriter::new_plain(Cursor::new(Vec::new()), ArchiveOptions::default()).unwrap();
            writer.add_entry("bench.bin", black_box(&data)).unwrap();
            writer.close().unwrap();
        })
    });
}

fn bench_unpack(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 253) as u8).collect();
    let hash = bench_hash();

    for (label, integrity) in [("none", Integrity::None), ("digest", Integrity::Digest), ("mac", Integrity::Mac)] {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let options = ArchiveOptions { integrity, ..Default::default() };
            let mut writer = ArchiveWriter::create(temp_file.path(), &hash, options).unwrap();
            writer.add_entry("bench.bin", &data).unwrap();
            writer.close().unwrap();
        }
        let mut reader = ArchiveReader::open(temp_file.path()).unwrap();
        reader.authenticate_hash(&hash).unwrap();

        c.bench_function(&format!("unpack_1mb_zstd_{label}"), |b| {
            b.iter(|| black_box(reader.read_entry("bench.bin").unwrap()))
        });
    }
}

criterion_group!(benches, bench_pack, bench_unpack);
criterion_main!(benches);
