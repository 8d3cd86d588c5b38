//! Round-trip cost of invoke-command against the simulated secure world

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use kaal_tee_mock::{FnTrustedApp, MockDriver, TaContext};
use kaal_teec::{ConnectionMethod, Context, Operation, Parameter, Uuid};

const ECHO: Uuid = Uuid::new(0xbe4c_0001, 0, 0, [0; 8]);

const BUFFER_SIZES: [usize; 4] = [0, 64, 4096, 65536];

fn context() -> Context<MockDriver> {
    let driver = MockDriver::new().with_trusted_app(ECHO, || {
        Box::new(FnTrustedApp::new(|_, ctx: &mut TaContext<'_>| {
            let (a, b) = ctx.value(0);
            ctx.set_value(0, a.wrapping_add(b), b);
            if ctx.is_mapped(1) {
                ctx.set_output_size(1, ctx.memref_capacity(1));
            }
            Ok(())
        }))
    });
    match Context::initialize(driver, None) {
        Ok(context) => context,
        Err(e) => panic!("context: {}", e),
    }
}

fn bench_value_invoke(c: &mut Criterion) {
    let context = context();
    let session = context
        .open_session(&ECHO, ConnectionMethod::Public, None)
        .unwrap();

    c.bench_function("invoke_value", |b| {
        b.iter(|| {
            let mut operation = Operation::new(
                Parameter::value_inout(black_box(1), 2),
                Parameter::None,
                Parameter::None,
                Parameter::None,
            );
            session.invoke_command(0, Some(&mut operation)).unwrap();
            black_box(operation.param(0).value())
        })
    });
}

fn bench_buffer_invoke(c: &mut Criterion) {
    let context = context();
    let session = context
        .open_session(&ECHO, ConnectionMethod::Public, None)
        .unwrap();

    let mut group = c.benchmark_group("invoke_tmp_inout");
    for size in BUFFER_SIZES {
        let mut buffer = vec![0u8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut operation = Operation::new(
                    Parameter::value_input(0, 0),
                    Parameter::tmp_inout(&mut buffer),
                    Parameter::None,
                    Parameter::None,
                );
                session.invoke_command(0, Some(&mut operation)).unwrap();
                black_box(operation.param(1).size())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_value_invoke, bench_buffer_invoke);
criterion_main!(benches);
