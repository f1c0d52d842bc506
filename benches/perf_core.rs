use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strategy_workbench::diff::render_unified_diff;
use strategy_workbench::patch::{
    apply_edits, build_patch, dedent, locate_enclosing, locate_named, locate_selection, reindent,
    PatchTarget,
};

fn synthetic_strategy(method_count: usize) -> String {
    let mut out = String::from(
        "from freqtrade.strategy import IStrategy\nimport talib.abstract as ta\n\n\nclass Synthetic(IStrategy):\n    timeframe = '5m'\n\n",
    );
    for i in 0..method_count {
        out.push_str(&format!(
            "    @property\n    def helper_{i:04}(self, dataframe, metadata):\n        value = dataframe['close'].rolling({w}).mean()\n        if value.iloc[-1] > {i}:\n            return value\n\n        return dataframe\n\n",
            w = i % 50 + 2
        ));
    }
    out.push_str(
        "    def populate_indicators(self, dataframe, metadata):\n        dataframe['rsi'] = ta.RSI(dataframe)\n        return dataframe\n",
    );
    out
}

fn bench_locate(c: &mut Criterion) {
    let file = synthetic_strategy(2_000);
    let line_count = file.lines().count();

    c.bench_function("locate_enclosing_tail", |b| {
        b.iter(|| locate_enclosing(black_box(&file), black_box(line_count - 1)))
    });

    c.bench_function("locate_named_last", |b| {
        b.iter(|| locate_named(black_box(&file), black_box("populate_indicators")))
    });

    c.bench_function("locate_selection_unique", |b| {
        b.iter(|| locate_selection(black_box(&file), black_box("        if value.iloc[-1] > 1999:\n")))
    });
}

fn bench_normalize(c: &mut Criterion) {
    let snippet: String = (0..400)
        .map(|i| format!("            line_{i} = compute({i})\n"))
        .collect();
    c.bench_function("reindent_snippet", |b| {
        b.iter(|| reindent(black_box(&snippet), black_box("        ")))
    });
    c.bench_function("dedent_snippet", |b| b.iter(|| dedent(black_box(&snippet))));
}

fn bench_patch_and_apply(c: &mut Criterion) {
    let file = synthetic_strategy(2_000);
    let snippet = "def populate_indicators(self, dataframe, metadata):\n    dataframe['rsi'] = ta.RSI(dataframe, timeperiod=7)\n    return dataframe\n";
    let plan = build_patch(&file, PatchTarget::Named(None), snippet).expect("patch should build");

    c.bench_function("apply_named_edit", |b| {
        b.iter(|| apply_edits(black_box(&file), std::slice::from_ref(&plan.edit)))
    });

    let (patched, _) = apply_edits(&file, std::slice::from_ref(&plan.edit)).expect("edit applies");
    c.bench_function("render_preview_diff", |b| {
        b.iter(|| render_unified_diff(black_box(&file), black_box(&patched)))
    });
}

criterion_group!(benches, bench_locate, bench_normalize, bench_patch_and_apply);
criterion_main!(benches);
