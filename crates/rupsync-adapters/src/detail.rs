//! Heuristic extraction of package details from a detail page.
//!
//! Two passes: first label/value cell pairs under known headings, then, when
//! that yields nothing, a keyword scan over every cell in document order.

use rupsync_core::locale::{parse_indonesian_date, parse_rupiah};
use rupsync_core::validate::is_date;
use rupsync_core::{DetailFields, ScheduleWindow};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;

const LABEL_SIMILARITY: f64 = 0.95;
const MAX_LABEL_LEN: usize = 60;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Heading {
    KodeRup,
    NamaPaket,
    NamaKlpd,
    SatuanKerja,
    TahunAnggaran,
    LokasiPekerjaan,
    SumberDana,
    JenisPengadaan,
    TotalPagu,
    MetodePemilihan,
    Pemanfaatan,
    JadwalKontrak,
    JadwalPemilihan,
    TanggalUmumkan,
}

const HEADINGS: &[(&str, Heading)] = &[
    ("kode rup", Heading::KodeRup),
    ("nama paket", Heading::NamaPaket),
    ("nama klpd", Heading::NamaKlpd),
    ("satuan kerja", Heading::SatuanKerja),
    ("tahun anggaran", Heading::TahunAnggaran),
    ("lokasi pekerjaan", Heading::LokasiPekerjaan),
    ("sumber dana", Heading::SumberDana),
    ("jenis pengadaan", Heading::JenisPengadaan),
    ("total pagu", Heading::TotalPagu),
    ("metode pemilihan", Heading::MetodePemilihan),
    ("pemanfaatan barang/jasa", Heading::Pemanfaatan),
    ("jadwal pelaksanaan kontrak", Heading::JadwalKontrak),
    ("jadwal pemilihan penyedia", Heading::JadwalPemilihan),
    ("tanggal umumkan paket", Heading::TanggalUmumkan),
];

const FUNDING_WORDS: &[&str] = &["apbd", "apbn", "blud", "phln", "dak ", "dau "];
const LOCATION_WORDS: &[&str] = &["kabupaten", "kota ", "provinsi", "(kab.)", "(kota)", "kab."];
const SUB_TABLE_HEADER_WORDS: &[&str] = &[
    "no", "no.", "mulai", "akhir", "sumber dana", "t.a.", "klpd", "mak", "pagu", "provinsi",
    "kabupaten/kota", "detail lokasi",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPass {
    Labeled,
    Keyword,
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailExtraction {
    pub fields: DetailFields,
    pub pass: ExtractionPass,
    pub labeled_hits: usize,
}

impl DetailExtraction {
    /// A page counts as extracted only when it produced a package name.
    pub fn succeeded(&self) -> bool {
        self.fields.has_package_name()
    }
}

struct Selectors {
    row: Selector,
    cell: Selector,
    table: Selector,
}

impl Selectors {
    fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            row: selector("tr")?,
            cell: selector("td, th")?,
            table: selector("table")?,
        })
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub fn extract_detail(html: &str) -> Result<DetailExtraction, ExtractError> {
    let sel = Selectors::new()?;
    let document = Html::parse_document(html);

    let mut fields = DetailFields::default();
    let labeled_hits = labeled_pass(&document, &sel, &mut fields);

    let pass = if labeled_hits > 0 && !fields.is_empty() {
        ExtractionPass::Labeled
    } else {
        fields = DetailFields::default();
        keyword_pass(&document, &sel, &mut fields);
        if fields.is_empty() {
            ExtractionPass::Nothing
        } else {
            ExtractionPass::Keyword
        }
    };

    dedup_in_place(&mut fields.sumber_dana);
    dedup_in_place(&mut fields.lokasi_pekerjaan);
    fields.unlabeled_dates.sort();
    fields.unlabeled_dates.dedup();

    Ok(DetailExtraction {
        fields,
        pass,
        labeled_hits,
    })
}

fn labeled_pass(document: &Html, sel: &Selectors, fields: &mut DetailFields) -> usize {
    let mut hits = 0;
    for row in document.select(&sel.row).filter(|row| !is_nested_row(*row)) {
        let cells = row_cells(row);
        let mut i = 0;
        while i < cells.len() {
            let Some(heading) = match_heading(&cell_text(cells[i])) else {
                i += 1;
                continue;
            };
            let Some(j) = value_index(&cells, i + 1) else {
                break;
            };
            if match_heading(&cell_text(cells[j])).is_some() {
                i = j;
                continue;
            }
            if apply_heading(heading, cells[j], sel, fields) {
                hits += 1;
            }
            i = j + 1;
        }
    }
    hits
}

/// Rows of a table that sits inside another table's cell.
fn is_nested_row(row: ElementRef<'_>) -> bool {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|el| el.value().name() == "td")
}

/// Skips separator cells such as `:` between a label and its value.
/// An empty cell followed by another label is the (empty) value.
fn value_index(cells: &[ElementRef<'_>], from: usize) -> Option<usize> {
    (from..cells.len()).find(|&k| {
        let text = cell_text(cells[k]);
        if text == ":" {
            return false;
        }
        if !text.is_empty() {
            return true;
        }
        cells
            .get(k + 1)
            .map_or(true, |next| match_heading(&cell_text(*next)).is_some())
    })
}

fn apply_heading(
    heading: Heading,
    value: ElementRef<'_>,
    sel: &Selectors,
    fields: &mut DetailFields,
) -> bool {
    let text = cell_text(value);
    let sub_table = value.select(&sel.table).next().map(|t| sub_table_rows(t, sel));

    match heading {
        Heading::KodeRup => set_text(&mut fields.kode_rup, text),
        Heading::NamaPaket => set_text(&mut fields.nama_paket, text),
        Heading::NamaKlpd => set_text(&mut fields.nama_klpd, text),
        Heading::SatuanKerja => set_text(&mut fields.satuan_kerja, text),
        Heading::TahunAnggaran => set_text(&mut fields.tahun_anggaran, text),
        Heading::JenisPengadaan => set_text(&mut fields.jenis_pengadaan, text),
        Heading::MetodePemilihan => set_text(&mut fields.metode_pemilihan, text),
        Heading::TotalPagu => {
            fields.total_pagu = parse_rupiah(&text);
            fields.total_pagu.is_some()
        }
        Heading::TanggalUmumkan => {
            fields.tanggal_umumkan = parse_indonesian_date(&text);
            fields.tanggal_umumkan.is_some()
        }
        Heading::SumberDana => {
            let found = match &sub_table {
                Some(table) => table.column_values(&["sumber dana"], 1),
                None => split_list(&text),
            };
            let hit = !found.is_empty();
            fields.sumber_dana.extend(found);
            hit
        }
        Heading::LokasiPekerjaan => {
            let found = match &sub_table {
                Some(table) => table.joined_rows(),
                None => split_list(&text),
            };
            let hit = !found.is_empty();
            fields.lokasi_pekerjaan.extend(found);
            hit
        }
        Heading::Pemanfaatan => set_window(&mut fields.pemanfaatan, sub_table.as_ref(), &text),
        Heading::JadwalKontrak => set_window(&mut fields.jadwal_kontrak, sub_table.as_ref(), &text),
        Heading::JadwalPemilihan => {
            set_window(&mut fields.jadwal_pemilihan, sub_table.as_ref(), &text)
        }
    }
}

fn set_text(slot: &mut Option<String>, text: String) -> bool {
    if text.is_empty() {
        return false;
    }
    *slot = Some(text);
    true
}

fn set_window(slot: &mut ScheduleWindow, table: Option<&SubTable>, text: &str) -> bool {
    let window = match table {
        Some(table) => table.window(),
        None => window_from_text(text),
    };
    if window.is_empty() {
        return false;
    }
    *slot = window;
    true
}

fn window_from_text(text: &str) -> ScheduleWindow {
    let parts: Vec<&str> = ["s/d", "S/D", "s.d.", "sampai", "Sampai", " - "]
        .iter()
        .find_map(|sep| text.find(sep).map(|at| (at, sep.len())))
        .map(|(at, len)| vec![&text[..at], &text[at + len..]])
        .unwrap_or_else(|| vec![text]);
    ScheduleWindow {
        start: parts.first().and_then(|p| parse_indonesian_date(p)),
        end: parts.get(1).and_then(|p| parse_indonesian_date(p)),
    }
}

fn split_list(text: &str) -> Vec<String> {
    text.split([',', ';', '\n'])
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Rows of a nested table, with the header row (if any) split off.
struct SubTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl SubTable {
    fn column_index(&self, names: &[&str]) -> Option<usize> {
        self.header.iter().position(|h| {
            let h = h.to_lowercase();
            names.iter().any(|name| h.contains(name))
        })
    }

    fn column_values(&self, names: &[&str], fallback: usize) -> Vec<String> {
        let idx = self.column_index(names).unwrap_or(fallback);
        self.rows
            .iter()
            .filter_map(|row| row.get(idx).or_else(|| row.last()))
            .filter(|v| !v.is_empty())
            .cloned()
            .collect()
    }

    fn joined_rows(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|cell| !cell.is_empty() && !cell.chars().all(|c| c.is_ascii_digit() || c == '.'))
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|joined| !joined.is_empty())
            .collect()
    }

    fn window(&self) -> ScheduleWindow {
        let start_idx = self.column_index(&["mulai", "awal"]).unwrap_or(0);
        let end_idx = self.column_index(&["akhir", "selesai"]).unwrap_or(1);
        self.rows
            .iter()
            .map(|row| ScheduleWindow {
                start: row.get(start_idx).and_then(|v| parse_indonesian_date(v)),
                end: row.get(end_idx).and_then(|v| parse_indonesian_date(v)),
            })
            .find(|w| !w.is_empty())
            .unwrap_or_default()
    }
}

fn sub_table_rows(table: ElementRef<'_>, sel: &Selectors) -> SubTable {
    let mut header = Vec::new();
    let mut rows = Vec::new();
    for row in table.select(&sel.row) {
        let cells = row_cells(row);
        if cells.is_empty() {
            continue;
        }
        let texts: Vec<String> = cells.iter().map(|c| cell_text(*c)).collect();
        let all_th = cells.iter().all(|c| c.value().name() == "th");
        let looks_like_header = header.is_empty()
            && rows.is_empty()
            && texts
                .iter()
                .any(|t| SUB_TABLE_HEADER_WORDS.contains(&t.to_lowercase().as_str()));
        if all_th || looks_like_header {
            header = texts;
        } else {
            rows.push(texts);
        }
    }
    SubTable { header, rows }
}

fn keyword_pass(document: &Html, sel: &Selectors, fields: &mut DetailFields) {
    let cells: Vec<String> = document
        .select(&sel.cell)
        .map(|cell| own_text(cell, sel))
        .collect();

    for (i, text) in cells.iter().enumerate() {
        if text.is_empty() {
            continue;
        }
        let lower = text.to_lowercase();

        if lower.contains("nama paket") && fields.nama_paket.is_none() {
            if let Some(name) = cells[i + 1..]
                .iter()
                .find(|next| !next.is_empty() && next.as_str() != ":")
            {
                fields.nama_paket = Some(name.clone());
            }
            continue;
        }

        if text.len() <= 80 && FUNDING_WORDS.iter().any(|w| format!("{lower} ").contains(w)) {
            fields.sumber_dana.push(text.clone());
        }
        if text.len() <= 120 && LOCATION_WORDS.iter().any(|w| format!("{lower} ").contains(w)) {
            fields.lokasi_pekerjaan.push(text.clone());
        }
        if text.len() <= 60 && is_date(text) {
            if let Some(date) = parse_indonesian_date(text) {
                fields.unlabeled_dates.push(date);
            }
        }
    }
}

fn row_cells(row: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "td" | "th"))
        .collect()
}

fn cell_text(cell: ElementRef<'_>) -> String {
    collapse_whitespace(&cell.text().collect::<Vec<_>>().join(" "))
}

/// Text of a cell without the text of any table nested inside it.
fn own_text(cell: ElementRef<'_>, sel: &Selectors) -> String {
    if cell.select(&sel.table).next().is_none() {
        return cell_text(cell);
    }
    let nested: Vec<String> = cell.select(&sel.cell).map(cell_text).collect();
    let mut text = cell_text(cell);
    for inner in nested {
        if !inner.is_empty() {
            text = text.replacen(&inner, " ", 1);
        }
    }
    collapse_whitespace(&text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_label(label: &str) -> String {
    collapse_whitespace(&label.replace(':', " ")).to_lowercase()
}

fn match_heading(label: &str) -> Option<Heading> {
    let label = normalize_label(label);
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return None;
    }
    if let Some((_, heading)) = HEADINGS
        .iter()
        .find(|(name, _)| label == *name || label.starts_with(&format!("{name} ")))
    {
        return Some(*heading);
    }
    HEADINGS
        .iter()
        .map(|(name, heading)| (jaro_winkler(&label, name), *heading))
        .filter(|(score, _)| *score >= LABEL_SIMILARITY)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, heading)| heading)
}

fn dedup_in_place(values: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    values.retain(|v| seen.insert(v.to_lowercase()));
}
