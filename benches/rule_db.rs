//! Benchmarks for rule-file parsing and multi-record reads.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use vendorfx::endpoint::{EndpointKey, Flow};
use vendorfx::reader::{self, ReadMode};
use vendorfx::rules::RuleDatabase;
use vendorfx::store::{MemStore, Scope, SectionPath, TypedValue};

const BLOCKS: usize = 12;

fn fx_section(name: &str, blocks: usize) -> String {
    let mut out = format!(
        "[{name}]\ntype = fx\nfx_name = {name}\nmulti_write = 1\nwrite_count = {blocks}\ndecider_index = 1\nquorum_threshold = 0.60\n"
    );
    for i in 1..=blocks {
        let hive = if i % 2 == 0 { "HKLM" } else { "HKCU" };
        out.push_str(&format!(
            "write{i}_hive = {hive}\nwrite{i}_name = {{fx}},{i}\nwrite{i}_enable = 1\nwrite{i}_disable = 0\n"
        ));
    }
    out.push_str("devices = {e},{f}\n\n");
    out
}

fn rule_file(rules: usize) -> String {
    let mut text = String::from("; generated\n\n");
    for r in 0..rules {
        text.push_str(&format!(
            "[main_{r}]\nvalue_name = {{m}},{r}\ndword_enable = 0\ndword_disable = 1\ndevices = {{e}}\n\n"
        ));
        text.push_str(&fx_section(&format!("fx_{r}"), 4));
    }
    text
}

fn bench_parse(c: &mut Criterion) {
    let text = rule_file(200);
    c.bench_function("parse_400_sections", |bench| {
        bench.iter(|| black_box(RuleDatabase::parse(black_box(&text), 0.6)))
    });

    let db = RuleDatabase::parse(&text, 0.6);
    c.bench_function("render_400_sections", |bench| bench.iter(|| black_box(db.render())));
}

fn bench_quorum_read(c: &mut Criterion) {
    let db = RuleDatabase::parse(&fx_section("bench", BLOCKS), 0.6);
    let rule = db.rules().next().map(|r| r.view()).unwrap();
    let endpoint = EndpointKey::parse("{e}").unwrap();
    let section = SectionPath::new(Flow::Render, &endpoint, "FxProperties");
    let store = MemStore::new();
    for i in 1..=BLOCKS {
        let scope = if i % 2 == 0 { Scope::Machine } else { Scope::User };
        store.insert(scope, &section, &format!("{{fx}},{i}"), TypedValue::Integer((i % 3 != 0) as u32));
    }

    c.bench_function("quorum_read_12_blocks", |bench| {
        bench.iter(|| black_box(reader::read_state(&store, rule, &endpoint, Flow::Render, ReadMode::Full)))
    });
    c.bench_function("fast_read_12_blocks", |bench| {
        bench.iter(|| black_box(reader::read_state(&store, rule, &endpoint, Flow::Render, ReadMode::Fast)))
    });

}

criterion_group!(benches, bench_parse, bench_quorum_read);
criterion_main!(benches);
