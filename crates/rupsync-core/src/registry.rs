//! Static per-table field declarations.
//!
//! Every target table is a [`FieldMapping`] value. Adding a table means adding
//! one more static entry to [`MAPPINGS`]; nothing else dispatches on table ids.

use serde::Serialize;

use crate::validate;

/// Columns that make up the natural key in every sink table.
pub const KEY_CODE_FIELD: &str = "kode_rup";
pub const KEY_NAME_FIELD: &str = "nama_paket";

pub type Validator = fn(&str) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Code,
    Date,
    Currency,
    Text,
}

impl FieldKind {
    pub fn validator(self) -> Option<Validator> {
        match self {
            FieldKind::Code => Some(validate::is_rup_code as Validator),
            FieldKind::Date => Some(validate::is_date as Validator),
            FieldKind::Currency => Some(validate::is_currency as Validator),
            FieldKind::Text => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub default: &'static str,
}

impl FieldSpec {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            default: "",
        }
    }

    pub const fn code(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Code,
            default: "",
        }
    }

    pub const fn date(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Date,
            default: "",
        }
    }

    pub const fn currency(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Currency,
            default: "",
        }
    }

    /// Returns whether `value` is admissible for this field.
    pub fn admits(&self, value: &str) -> bool {
        match self.kind.validator() {
            Some(check) => check(value),
            None => true,
        }
    }
}

/// Ordered field declaration for one sink table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldMapping {
    pub table_id: &'static str,
    pub table_name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl FieldMapping {
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn first_of_kind(&self, kind: FieldKind) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.kind == kind)
    }

    pub fn is_key_field(name: &str) -> bool {
        name == KEY_CODE_FIELD || name == KEY_NAME_FIELD
    }
}

pub static PERENCANAAN: FieldMapping = FieldMapping {
    table_id: "perencanaan",
    table_name: "spse_perencanaan",
    fields: &[
        FieldSpec::code("kode_rup"),
        FieldSpec::text("satuan_kerja"),
        FieldSpec::text("nama_paket"),
        FieldSpec::text("metode_pemilihan"),
        FieldSpec::date("tanggal_pengumuman"),
        FieldSpec::text("rencana_pemilihan"),
        FieldSpec::currency("pagu_rup"),
        FieldSpec::text("kode_satuan_kerja"),
        FieldSpec::text("cara_pengadaan"),
        FieldSpec::text("jenis_pengadaan"),
        FieldSpec::text("pdn"),
        FieldSpec::text("umk"),
        FieldSpec::text("sumber_dana"),
        FieldSpec::text("kode_rup_lokal"),
        FieldSpec::text("akhir_pemilihan"),
        FieldSpec::text("tipe_swakelola"),
    ],
};

pub static PERSIAPAN: FieldMapping = FieldMapping {
    table_id: "persiapan",
    table_name: "spse_persiapan",
    fields: &[
        FieldSpec::code("kode_rup"),
        FieldSpec::text("satuan_kerja"),
        FieldSpec::text("nama_paket"),
        FieldSpec::text("metode_pemilihan"),
        FieldSpec::date("tanggal_buat_paket"),
        FieldSpec::currency("nilai_pagu_rup"),
        FieldSpec::currency("nilai_pagu_paket"),
        FieldSpec::text("kode_satuan_kerja"),
        FieldSpec::text("cara_pengadaan"),
        FieldSpec::text("jenis_pengadaan"),
        FieldSpec::text("pdn"),
        FieldSpec::text("umk"),
        FieldSpec::text("sumber_dana"),
        FieldSpec::text("kode_rup_lokal"),
        FieldSpec::text("metode_pengadaan"),
        FieldSpec::text("tipe_swakelola"),
    ],
};

pub static PEMILIHAN: FieldMapping = FieldMapping {
    table_id: "pemilihan",
    table_name: "spse_pemilihan",
    fields: &[
        FieldSpec::code("kode_rup"),
        FieldSpec::text("satuan_kerja"),
        FieldSpec::text("nama_paket"),
        FieldSpec::text("metode_pemilihan"),
        FieldSpec::text("rencana_pemilihan"),
        FieldSpec::date("tanggal_pemilihan"),
        FieldSpec::currency("nilai_hps"),
        FieldSpec::text("status_paket"),
        FieldSpec::text("kode_satuan_kerja"),
        FieldSpec::text("cara_pengadaan"),
        FieldSpec::text("jenis_pengadaan"),
        FieldSpec::text("pdn"),
        FieldSpec::text("umk"),
        FieldSpec::text("sumber_dana"),
        FieldSpec::text("kode_rup_lokal"),
        FieldSpec::text("metode_pengadaan"),
        FieldSpec::currency("pagu_rup"),
        FieldSpec::text("tipe_swakelola"),
        FieldSpec::text("akhir_pemilihan"),
    ],
};

pub static HASIL_PEMILIHAN: FieldMapping = FieldMapping {
    table_id: "hasilpemilihan",
    table_name: "spse_hasilpemilihan",
    fields: &[
        FieldSpec::code("kode_rup"),
        FieldSpec::text("satuan_kerja"),
        FieldSpec::text("nama_paket"),
        FieldSpec::text("metode_pemilihan"),
        FieldSpec::date("tanggal_hasil_pemilihan"),
        FieldSpec::currency("nilai_hasil_pemilihan"),
        FieldSpec::text("status_paket"),
        FieldSpec::text("kode_satuan_kerja"),
        FieldSpec::text("cara_pengadaan"),
        FieldSpec::text("jenis_pengadaan"),
        FieldSpec::text("pdn"),
        FieldSpec::text("umk"),
        FieldSpec::text("sumber_dana"),
        FieldSpec::text("kode_rup_lokal"),
        FieldSpec::text("metode_pengadaan"),
        FieldSpec::currency("pagu_rup"),
        FieldSpec::text("tipe_swakelola"),
    ],
};

pub static KONTRAK: FieldMapping = FieldMapping {
    table_id: "kontrak",
    table_name: "spse_kontrak",
    fields: &[
        FieldSpec::code("kode_rup"),
        FieldSpec::text("satuan_kerja"),
        FieldSpec::text("nama_paket"),
        FieldSpec::text("metode_pemilihan"),
        FieldSpec::date("tanggal_kontrak"),
        FieldSpec::currency("nilai_kontrak"),
        FieldSpec::text("status_paket"),
        FieldSpec::text("mulai_kontrak"),
        FieldSpec::currency("nilai_bap"),
        FieldSpec::text("selesai_kontrak"),
        FieldSpec::text("kode_satuan_kerja"),
        FieldSpec::text("cara_pengadaan"),
        FieldSpec::text("jenis_pengadaan"),
        FieldSpec::text("pdn"),
        FieldSpec::text("umk"),
        FieldSpec::text("sumber_dana"),
        FieldSpec::text("kode_rup_lokal"),
        FieldSpec::text("metode_pengadaan"),
        FieldSpec::text("tipe_swakelola"),
    ],
};

pub static SERAH_TERIMA: FieldMapping = FieldMapping {
    table_id: "serahterima",
    table_name: "spse_serahterima",
    fields: &[
        FieldSpec::code("kode_rup"),
        FieldSpec::text("satuan_kerja"),
        FieldSpec::text("nama_paket"),
        FieldSpec::text("metode_pemilihan"),
        FieldSpec::date("tanggal_serah_terima"),
        FieldSpec::currency("nilai_bap"),
        FieldSpec::text("status_paket"),
        FieldSpec::text("kode_satuan_kerja"),
        FieldSpec::text("cara_pengadaan"),
        FieldSpec::text("jenis_pengadaan"),
        FieldSpec::text("pdn"),
        FieldSpec::text("umk"),
        FieldSpec::text("sumber_dana"),
        FieldSpec::text("kode_rup_lokal"),
        FieldSpec::text("metode_pengadaan"),
        FieldSpec::text("tipe_swakelola"),
    ],
};

pub static MAPPINGS: &[&FieldMapping] = &[
    &PERENCANAAN,
    &PERSIAPAN,
    &PEMILIHAN,
    &HASIL_PEMILIHAN,
    &KONTRAK,
    &SERAH_TERIMA,
];

/// Enrichment rows are keyed off live rows of this table.
pub static ENRICHMENT_SOURCE: &FieldMapping = &PERENCANAAN;

pub const ENRICHMENT_TABLE: &str = "spse_perencanaansirup";

/// Looks up the mapping for a table id. `None` means no schema is known.
pub fn field_mapping(table_id: &str) -> Option<&'static FieldMapping> {
    MAPPINGS
        .iter()
        .copied()
        .find(|m| m.table_id == table_id)
}

pub fn table_ids() -> impl Iterator<Item = &'static str> {
    MAPPINGS.iter().map(|m| m.table_id)
}
