//! Ingesta de un fichero subido (CSV o Excel) en uno o varios `Document`,
//! más la vista previa tabular que se muestra en la barra lateral.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, open_workbook_auto_from_rs, Data, Range, Reader};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::models::{Document, FileKind, TablePreview, UploadedFile};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Convierte el fichero en documentos listos para indexar.
pub async fn load_documents(file: &UploadedFile) -> Result<Vec<Document>> {
    let docs = match file.kind {
        FileKind::Csv => vec![csv_to_document(&file.bytes)?],
        FileKind::Xls | FileKind::Xlsx => {
            let name = file.name.clone();
            let bytes = file.bytes.clone();
            tokio::task::spawn_blocking(move || excel_to_documents(&name, &bytes))
                .await
                .context("La tarea de lectura del Excel terminó de forma inesperada")??
        }
    };
    info!("Ingerido '{}' en {} documento(s).", file.name, docs.len());
    Ok(docs)
}

// ---------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------

/// Parsea el CSV (cabecera obligatoria) y lo re-serializa en forma canónica
/// como un único documento.
pub fn csv_to_document(bytes: &[u8]) -> Result<Document> {
    let (headers, rows) = parse_csv(bytes)?;

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(&headers)?;
    for row in &rows {
        writer.write_record(row)?;
    }
    let buffer = writer
        .into_inner()
        .map_err(|e| anyhow!("No se pudo serializar el CSV: {}", e.error()))?;
    let text = String::from_utf8(buffer).context("El CSV serializado no es UTF-8")?;

    debug!("CSV con {} columnas y {} filas", headers.len(), rows.len());
    Ok(Document::new(text))
}

fn parse_csv(bytes: &[u8]) -> Result<(csv::StringRecord, Vec<csv::StringRecord>)> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .context("No se pudo leer la cabecera del CSV")?
        .clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(anyhow!("El CSV no tiene columnas"));
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Fila {} mal formada", line + 2))?;
        rows.push(record);
    }
    Ok((headers, rows))
}

// ---------------------------------------------------------------------
// EXCEL
// ---------------------------------------------------------------------

/// Copia temporal del fichero subido. El directorio se borra al soltar el
/// valor, tanto si la lectura termina bien como si falla.
pub struct ScratchFile {
    // Se conserva sólo por su `Drop`, que borra el directorio.
    _dir: TempDir,
    path: PathBuf,
}

impl ScratchFile {
    pub fn write(filename: &str, bytes: &[u8]) -> Result<Self> {
        let dir = tempfile::tempdir().context("No se pudo crear el directorio temporal")?;
        // Sólo el nombre final: el navegador puede enviar rutas.
        let safe_name = Path::new(filename)
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| anyhow!("Nombre de fichero inválido: '{filename}'"))?;
        let path = dir.path().join(safe_name);
        fs::write(&path, bytes)
            .with_context(|| format!("No se pudo escribir {}", path.display()))?;
        Ok(Self { _dir: dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn excel_to_documents(filename: &str, bytes: &[u8]) -> Result<Vec<Document>> {
    let scratch = ScratchFile::write(filename, bytes)?;
    read_workbook(scratch.path(), filename)
}

/// Lee el libro desde disco y genera un documento markdown por hoja con texto.
fn read_workbook(path: &Path, filename: &str) -> Result<Vec<Document>> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("No se pudo abrir el libro '{filename}'"))?;

    let mut docs = Vec::new();
    for sheet in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&sheet)
            .with_context(|| format!("No se pudo leer la hoja '{sheet}'"))?;
        let Some(table) = range_to_markdown(&range) else {
            debug!("Hoja '{}' sin texto, se omite", sheet);
            continue;
        };
        let text = format!("## {sheet}\n\n{table}");
        docs.push(
            Document::new(text)
                .with_metadata("file_name", filename)
                .with_metadata("sheet_name", sheet.as_str()),
        );
    }

    if docs.is_empty() {
        return Err(anyhow!("El libro '{filename}' no contiene celdas con texto"));
    }
    Ok(docs)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

/// Filas con texto de un rango (las vacías se descartan).
fn range_rows(range: &Range<Data>) -> Vec<Vec<String>> {
    range
        .rows()
        .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
        .filter(|row| row.iter().any(|c| !c.is_empty()))
        .collect()
}

/// Tabla markdown con la primera fila como cabecera. `None` si no hay texto.
fn range_to_markdown(range: &Range<Data>) -> Option<String> {
    let rows = range_rows(range);
    let (header, body) = rows.split_first()?;

    let mut out = vec![
        markdown_row(header),
        format!("|{}", "---|".repeat(header.len())),
    ];
    out.extend(body.iter().map(|row| markdown_row(row)));
    Some(out.join("\n"))
}

fn markdown_row(cells: &[String]) -> String {
    let cells: Vec<String> = cells
        .iter()
        .map(|c| c.replace('|', "\\|").replace('\n', " "))
        .collect();
    format!("| {} |", cells.join(" | "))
}

// ---------------------------------------------------------------------
// VISTA PREVIA
// ---------------------------------------------------------------------

/// Re-parsea el fichero como tabla. Es sólo cosmético: el llamador trata el
/// error como no fatal.
pub async fn preview(file: &UploadedFile, max_rows: usize) -> Result<TablePreview> {
    let kind = file.kind;
    let bytes = file.bytes.clone();
    tokio::task::spawn_blocking(move || table_preview(kind, bytes, max_rows))
        .await
        .context("La tarea de vista previa terminó de forma inesperada")?
}

fn table_preview(kind: FileKind, bytes: Vec<u8>, max_rows: usize) -> Result<TablePreview> {
    match kind {
        FileKind::Csv => {
            let (headers, rows) = parse_csv(&bytes)?;
            let rows: Vec<Vec<String>> = rows
                .iter()
                .map(|r| r.iter().map(str::to_string).collect())
                .collect();
            Ok(build_preview(headers.iter().map(str::to_string).collect(), rows, max_rows))
        }
        FileKind::Xls | FileKind::Xlsx => {
            let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
                .context("No se pudo abrir el libro para la vista previa")?;
            let range = workbook
                .worksheet_range_at(0)
                .ok_or_else(|| anyhow!("El libro no tiene hojas"))??;
            let mut rows = range_rows(&range);
            if rows.is_empty() {
                return Err(anyhow!("La primera hoja está vacía"));
            }
            let columns = rows.remove(0);
            Ok(build_preview(columns, rows, max_rows))
        }
    }
}

fn build_preview(columns: Vec<String>, rows: Vec<Vec<String>>, max_rows: usize) -> TablePreview {
    let total_rows = rows.len();
    TablePreview {
        columns,
        rows: rows.into_iter().take(max_rows).collect(),
        total_rows,
        truncated: total_rows > max_rows,
    }
}
