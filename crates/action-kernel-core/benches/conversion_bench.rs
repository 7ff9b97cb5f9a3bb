use action_kernel_core::{
    convert_cell, ActionKind, ActionScope, ActionSelector, CellValue, FieldConfig, SelectOption,
    TableId,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn mk_options(count: i64) -> Vec<SelectOption> {
    (1..=count)
        .map(|id| SelectOption {
            id: Some(id),
            value: format!("Option {id}"),
            color: "green".to_string(),
        })
        .collect()
}

fn mk_cells(count: usize) -> Vec<CellValue> {
    (0..count)
        .map(|index| match index % 3 {
            0 => CellValue::Text(format!("Option {}", index % 50 + 1)),
            1 => CellValue::Text(format!("{index}.75")),
            _ => CellValue::Null,
        })
        .collect()
}

fn bench_text_to_select(c: &mut Criterion) {
    let cells = mk_cells(10_000);
    let to = FieldConfig::SingleSelect { options: mk_options(50) };

    c.bench_function("convert_text_to_select_10000_cells", |b| {
        b.iter(|| {
            for cell in &cells {
                black_box(convert_cell(cell, &FieldConfig::Text, &to));
            }
        });
    });
}

fn bench_text_to_number(c: &mut Criterion) {
    let cells = mk_cells(10_000);
    let to = FieldConfig::Number { decimal_places: 1 };

    c.bench_function("convert_text_to_number_10000_cells", |b| {
        b.iter(|| {
            for cell in &cells {
                black_box(convert_cell(cell, &FieldConfig::Text, &to));
            }
        });
    });
}

fn bench_selector_matching(c: &mut Criterion) {
    let selectors = (1..=64)
        .map(|id| ActionSelector::any_kind(ActionScope::Table(TableId(id))))
        .collect::<Vec<_>>();

    c.bench_function("match_64_selectors", |b| {
        b.iter(|| {
            let hit = selectors
                .iter()
                .any(|selector| selector.matches(ActionKind::UpdateField, ActionScope::Table(TableId(64))));
            black_box(hit)
        });
    });
}

criterion_group!(conversion_benches, bench_text_to_select, bench_text_to_number, bench_selector_matching);
criterion_main!(conversion_benches);
