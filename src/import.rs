//! Bulk import of customers and product variants from CSV.
//!
//! The source is either a local file or a URL. Google Sheets links are
//! rewritten to their CSV export. Headers are matched loosely so sheets
//! written in Spanish or English both work.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::SupabaseClient;
use crate::customers::{self, clean_customer};
use crate::models::NewCustomer;
use crate::{Error, Result};

const VARIANTS_TABLE: &str = "product_variants";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
    File(PathBuf),
    Url(String),
}

impl ImportSource {
    pub fn parse(arg: &str) -> Self {
        let arg = arg.trim();
        if arg.starts_with("http://") || arg.starts_with("https://") {
            ImportSource::Url(sheets_export_url(arg).unwrap_or_else(|| arg.to_string()))
        } else {
            ImportSource::File(PathBuf::from(arg))
        }
    }

    pub async fn read(&self) -> Result<String> {
        let raw = match self {
            ImportSource::File(path) => tokio::fs::read_to_string(path).await?,
            ImportSource::Url(url) => {
                let http = reqwest::Client::builder()
                    .timeout(DOWNLOAD_TIMEOUT)
                    .build()
                    .map_err(|e| Error::Http(e.to_string()))?;
                let resp = http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| Error::Http(format!("Cannot download {url}: {e}")))?;
                let status = resp.status();
                let body = resp
                    .text()
                    .await
                    .map_err(|e| Error::Http(e.to_string()))?;
                if !status.is_success() {
                    return Err(Error::Api {
                        status: status.as_u16(),
                        message: format!("download of {url} failed"),
                    });
                }
                body
            }
        };
        Ok(raw.trim_start_matches('\u{feff}').to_string())
    }
}

/// `https://docs.google.com/spreadsheets/d/<id>/edit#gid=7` becomes
/// `https://docs.google.com/spreadsheets/d/<id>/export?format=csv&gid=7`.
pub fn sheets_export_url(url: &str) -> Option<String> {
    let marker = "docs.google.com/spreadsheets/d/";
    let start = url.find(marker)? + marker.len();
    let id: String = url[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if id.is_empty() {
        return None;
    }
    let gid = url
        .split(['?', '#', '&'])
        .find_map(|part| part.strip_prefix("gid="))
        .filter(|g| g.chars().all(|c| c.is_ascii_digit()) && !g.is_empty());
    let mut out = format!("https://docs.google.com/spreadsheets/d/{id}/export?format=csv");
    if let Some(gid) = gid {
        out.push_str("&gid=");
        out.push_str(gid);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Header mapping
// ---------------------------------------------------------------------------

fn fold_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' => 'a',
            'é' | 'è' | 'ë' => 'e',
            'í' | 'ì' | 'ï' => 'i',
            'ó' | 'ò' | 'ö' => 'o',
            'ú' | 'ù' | 'ü' => 'u',
            'ñ' => 'n',
            ' ' | '-' | '/' | '.' => '_',
            other => other,
        })
        .collect()
}

const CUSTOMER_FIELDS: &[(&str, &[&str])] = &[
    ("name", &["name", "nombre", "nombre_completo", "nombre_y_apellido", "cliente", "full_name"]),
    ("last_name", &["apellido", "last_name", "surname"]),
    ("phone", &["phone", "telefono", "tel", "celular", "whatsapp", "movil"]),
    ("dni", &["dni", "documento", "doc", "nro_documento", "cuit", "cuil"]),
    ("email", &["email", "e_mail", "mail", "correo", "correo_electronico"]),
    ("address", &["address", "direccion", "domicilio", "calle"]),
    ("city", &["city", "ciudad", "localidad"]),
    ("province", &["province", "provincia", "state", "estado"]),
];

const VARIANT_FIELDS: &[(&str, &[&str])] = &[
    ("sku", &["sku", "codigo", "cod", "code"]),
    ("product_name", &["product_name", "producto", "nombre", "product", "name", "articulo"]),
    ("color", &["color", "colour"]),
    ("size", &["size", "talle", "talla"]),
    ("price", &["price", "precio", "precio_venta"]),
    ("stock", &["stock", "cantidad", "qty", "quantity"]),
    ("category", &["category", "categoria", "rubro"]),
    ("type", &["type", "tipo", "product_type"]),
];

/// Column index per canonical field name.
fn map_headers(
    headers: &csv::StringRecord,
    fields: &[(&'static str, &[&str])],
) -> HashMap<&'static str, usize> {
    let folded: Vec<String> = headers.iter().map(fold_header).collect();
    let mut out = HashMap::new();
    for (field, aliases) in fields {
        if let Some(idx) = folded.iter().position(|h| aliases.contains(&h.as_str())) {
            out.insert(*field, idx);
        }
    }
    out
}

struct Row<'a> {
    record: &'a csv::StringRecord,
    columns: &'a HashMap<&'static str, usize>,
}

impl Row<'_> {
    fn get(&self, field: &str) -> Option<String> {
        let idx = *self.columns.get(field)?;
        self.record
            .get(idx)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

fn reader(text: &str) -> csv::Reader<&[u8]> {
    let first_line = text.lines().next().unwrap_or("");
    let delimiter = if first_line.matches(';').count() > first_line.matches(',').count() {
        b';'
    } else {
        b','
    };
    csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

/// Prices written either as `1500.50` or in local style `$ 1.500,50`.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(comma), None) if cleaned.len() - comma - 1 == 3 => {
            // "1,500" is a thousands separator, "1,5" a decimal one.
            cleaned.replace(',', "")
        }
        (Some(_), None) => cleaned.replace(',', "."),
        (None, Some(dot)) if cleaned.matches('.').count() > 1 || cleaned.len() - dot - 1 == 3 => {
            cleaned.replace('.', "")
        }
        _ => cleaned,
    };
    normalized.parse::<f64>().ok().filter(|p| p.is_finite() && *p >= 0.0)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantRow {
    pub sku: String,
    pub product_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    pub price: f64,
    pub stock: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    pub read: usize,
    pub skipped: usize,
}

pub fn parse_customers(text: &str) -> Result<Parsed<NewCustomer>> {
    let mut rdr = reader(text);
    let columns = map_headers(rdr.headers()?, CUSTOMER_FIELDS);
    if !columns.contains_key("name") {
        return Err(Error::validation("No name column found (expected 'nombre' or 'name')"));
    }
    let mut parsed = Parsed { rows: Vec::new(), read: 0, skipped: 0 };
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        parsed.read += 1;
        let row = Row { record: &record, columns: &columns };
        let name = match (row.get("name"), row.get("last_name")) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first,
            (None, _) => {
                parsed.skipped += 1;
                continue;
            }
        };
        let candidate = NewCustomer {
            name,
            phone: row.get("phone"),
            dni: row.get("dni"),
            email: row.get("email"),
            address: row.get("address"),
            city: row.get("city"),
            province: row.get("province"),
        };
        match clean_customer(candidate) {
            Ok(c) => parsed.rows.push(c),
            Err(e) => {
                warn!(line = line + 2, "skipping customer row: {e}");
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

pub fn parse_variants(text: &str) -> Result<Parsed<VariantRow>> {
    let mut rdr = reader(text);
    let columns = map_headers(rdr.headers()?, VARIANT_FIELDS);
    for required in ["sku", "product_name", "price"] {
        if !columns.contains_key(required) {
            return Err(Error::validation(format!("Missing column: {required}")));
        }
    }
    let mut parsed = Parsed { rows: Vec::new(), read: 0, skipped: 0 };
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        parsed.read += 1;
        let row = Row { record: &record, columns: &columns };
        let (Some(sku), Some(product_name)) = (row.get("sku"), row.get("product_name")) else {
            parsed.skipped += 1;
            continue;
        };
        let Some(price) = row.get("price").as_deref().and_then(parse_price) else {
            warn!(line = line + 2, sku = %sku, "skipping variant row: bad price");
            parsed.skipped += 1;
            continue;
        };
        let stock = row
            .get("stock")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|s| s.max(0.0) as i64)
            .unwrap_or(0);
        parsed.rows.push(VariantRow {
            sku,
            product_name,
            color: row.get("color"),
            size: row.get("size"),
            price,
            stock,
            category: row.get("category"),
            product_type: row.get("type"),
            active: true,
        });
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub read: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed_batches: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub batch_size: usize,
    /// Parse and report without writing anything.
    pub dry_run: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::config::DEFAULT_IMPORT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

pub async fn import_customers(
    client: &SupabaseClient,
    source: &ImportSource,
    options: ImportOptions,
) -> Result<ImportReport> {
    if options.batch_size == 0 {
        return Err(Error::validation("Batch size must be at least 1"));
    }
    let parsed = parse_customers(&source.read().await?)?;
    let mut report = ImportReport {
        read: parsed.read,
        skipped: parsed.skipped,
        ..Default::default()
    };
    if options.dry_run {
        report.imported = parsed.rows.len();
        return Ok(report);
    }
    let run_id = uuid::Uuid::new_v4();
    for (n, batch) in parsed.rows.chunks(options.batch_size).enumerate() {
        match customers::bulk_create(client, batch).await {
            Ok(created) => {
                report.imported += created;
                info!(%run_id, batch = n + 1, created, "customer batch imported");
            }
            Err(e) => {
                report.failed_batches += 1;
                warn!(%run_id, batch = n + 1, size = batch.len(), "customer batch failed: {e}");
            }
        }
    }
    info!(%run_id, ?report, "customer import finished");
    Ok(report)
}

pub async fn import_variants(
    client: &SupabaseClient,
    source: &ImportSource,
    options: ImportOptions,
) -> Result<ImportReport> {
    if options.batch_size == 0 {
        return Err(Error::validation("Batch size must be at least 1"));
    }
    let parsed = parse_variants(&source.read().await?)?;
    let mut report = ImportReport {
        read: parsed.read,
        skipped: parsed.skipped,
        ..Default::default()
    };
    if options.dry_run {
        report.imported = parsed.rows.len();
        return Ok(report);
    }
    let run_id = uuid::Uuid::new_v4();
    for (n, batch) in parsed.rows.chunks(options.batch_size).enumerate() {
        match client.upsert(VARIANTS_TABLE, "sku", batch).await {
            Ok(written) => {
                report.imported += written;
                info!(%run_id, batch = n + 1, written, "variant batch upserted");
            }
            Err(e) => {
                report.failed_batches += 1;
                warn!(%run_id, batch = n + 1, size = batch.len(), "variant batch failed: {e}");
            }
        }
    }
    info!(%run_id, ?report, "variant import finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheets_links_become_csv_exports() {
        assert_eq!(
            sheets_export_url("https://docs.google.com/spreadsheets/d/1AbC-x_9/edit#gid=42").unwrap(),
            "https://docs.google.com/spreadsheets/d/1AbC-x_9/export?format=csv&gid=42"
        );
        assert_eq!(
            sheets_export_url("https://docs.google.com/spreadsheets/d/XYZ/edit?usp=sharing").unwrap(),
            "https://docs.google.com/spreadsheets/d/XYZ/export?format=csv"
        );
        assert_eq!(sheets_export_url("https://example.com/data.csv"), None);

        assert_eq!(
            ImportSource::parse("clientes.csv"),
            ImportSource::File(PathBuf::from("clientes.csv"))
        );
        assert_eq!(
            ImportSource::parse("https://example.com/data.csv"),
            ImportSource::Url("https://example.com/data.csv".into())
        );
    }

    #[test]
    fn prices_in_both_styles() {
        assert_eq!(parse_price("1500.50"), Some(1500.5));
        assert_eq!(parse_price("$ 1.500,50"), Some(1500.5));
        assert_eq!(parse_price("1,5"), Some(1.5));
        assert_eq!(parse_price("1.500"), Some(1500.0));
        assert_eq!(parse_price("1,500.25"), Some(1500.25));
        assert_eq!(parse_price("abc"), None);
        assert_eq!(parse_price("-3"), None);
    }

    #[test]
    fn customers_with_spanish_headers() {
        let csv = "\
Nombre;Apellido;Teléfono;DNI;Correo
Ana;Pérez;11 5555-1234;30.123.456;ANA@mail.com
;Sin nombre;123;;
Juan;;351 444 0000;;no-es-mail
Luis;Gómez;;;
";
        let parsed = parse_customers(csv).unwrap();
        assert_eq!(parsed.read, 4);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].name, "Ana Pérez");
        assert_eq!(parsed.rows[0].phone.as_deref(), Some("1155551234"));
        assert_eq!(parsed.rows[0].dni.as_deref(), Some("30123456"));
        assert_eq!(parsed.rows[0].email.as_deref(), Some("ana@mail.com"));
        assert_eq!(parsed.rows[1].name, "Luis Gómez");
    }

    #[test]
    fn customers_need_a_name_column() {
        assert!(parse_customers("phone,email\n123,a@b.c\n").is_err());
    }

    #[test]
    fn variants_with_english_headers() {
        let csv = "\
SKU,Product,Color,Size,Price,Stock,Category,Type
RL-NEG-M,Remera lisa,Negro,M,12500,4,Mujer,remera
RL-NEG-L,Remera lisa,Negro,L,not-a-price,2,Mujer,remera
,Sin sku,Rojo,S,100,1,,
JN-AZ-40,Jean,Azul,40,\"35000,00\",,Hombre,jean
";
        let parsed = parse_variants(csv).unwrap();
        assert_eq!(parsed.read, 4);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].sku, "RL-NEG-M");
        assert_eq!(parsed.rows[0].stock, 4);
        assert_eq!(parsed.rows[1].price, 35000.0);
        assert_eq!(parsed.rows[1].stock, 0);

        let json = serde_json::to_value(&parsed.rows[0]).unwrap();
        assert_eq!(json["type"], "remera");
        assert_eq!(json["active"], true);
    }

    #[test]
    fn variants_report_missing_columns() {
        let err = parse_variants("sku,nombre\nA,B\n").unwrap_err();
        assert!(err.to_string().contains("price"));
    }
}
