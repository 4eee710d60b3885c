use criterion::{Criterion, black_box, criterion_group, criterion_main};
use halo_e2e::{
    IdentityKeyPair, InMemoryProtocolStore, ProtocolAddress, SessionBuilder, SessionCipher,
    create_pre_key_bundle,
};
use rand_core::OsRng;

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");

    group.bench_function("identity_keypair", |b| {
        b.iter(|| black_box(IdentityKeyPair::generate(&mut OsRng)));
    });

    group.bench_function("pre_key_bundle", |b| {
        // Fresh store per bundle so random pre-key ids never collide
        b.iter_batched(
            || InMemoryProtocolStore::generate(&mut OsRng),
            |store| black_box(create_pre_key_bundle(&store, 1, &mut OsRng).unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("handshake");

    let alice = InMemoryProtocolStore::generate(&mut OsRng);
    let bob = InMemoryProtocolStore::generate(&mut OsRng);
    let bob_address = ProtocolAddress::new("bob", 1);
    let bundle = create_pre_key_bundle(&bob, 1, &mut OsRng).unwrap();

    group.bench_function("process_bundle", |b| {
        let builder = SessionBuilder::new(&alice, bob_address.clone());
        b.iter(|| builder.process(&mut OsRng, black_box(&bundle)).unwrap());
    });

    group.bench_function("full_handshake", |b| {
        b.iter(|| {
            let alice = InMemoryProtocolStore::generate(&mut OsRng);
            let bob = InMemoryProtocolStore::generate(&mut OsRng);
            let bob_address = ProtocolAddress::new("bob", 1);
            let alice_address = ProtocolAddress::new("alice", 1);

            let bundle = create_pre_key_bundle(&bob, 1, &mut OsRng).unwrap();
            SessionBuilder::new(&alice, bob_address.clone())
                .process(&mut OsRng, &bundle)
                .unwrap();
            let hello = SessionCipher::new(&alice, bob_address)
                .encrypt(b"hello")
                .unwrap();

            black_box(
                SessionCipher::new(&bob, alice_address)
                    .decrypt(&mut OsRng, &hello)
                    .unwrap(),
            )
        });
    });

    group.finish();
}

fn bench_signature_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("signatures");

    let store = InMemoryProtocolStore::generate(&mut OsRng);
    let bundle = create_pre_key_bundle(&store, 1, &mut OsRng).unwrap();

    group.bench_function("verify_bundle", |b| {
        b.iter(|| black_box(bundle.verify_signature()).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_handshake,
    bench_signature_verification
);
criterion_main!(benches);
