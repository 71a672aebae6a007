//! Turns fetched report pages into findings records and listing units.
//!
//! Everything here is pure: the same HTML always yields the same result.
//! Tables are located by named strategies tried in order, and only a table
//! whose header row names the required columns is accepted.

use scraper::{ElementRef, Html};
use url::Url;

use crate::fetch::RawPage;
use crate::formats::FindingRow;
use crate::key::{Key, Place, Target};

/// Most specific first. The generic phrase also appears in the page banner.
const FINDINGS_HEADINGS: [&str; 2] = ["issues reported", "audit findings"];
const NO_RECORD_MARKERS: [&str; 3] = ["no record found", "no records found", "no data found"];
const PLACEHOLDER_OPTIONS: [&str; 5] = ["", "0", "all", "select", "choose"];

/// One parsed audit-finding row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Key,
    /// Filled in from the listing; the findings page does not repeat it.
    pub place: Place,
    pub gs_date: Option<String>,
    /// 1-based position among the table's data rows.
    pub row: usize,
    pub category: String,
    pub sub_category: Option<String>,
    pub finding: String,
    /// Amount involved, in rupees.
    pub amount: Option<f64>,
    pub status: Option<String>,
}

impl Record {
    pub fn to_row(&self) -> FindingRow {
        FindingRow {
            state: self.key.state.name().to_owned(),
            state_code: self.key.state.code().to_owned(),
            district: self.place.district.clone(),
            block: self.place.block.clone(),
            panchayat: self.place.panchayat.clone(),
            unit: self.key.unit.clone(),
            year: self.key.year,
            audit_year: self.key.audit_year(),
            gs_date: self.gs_date.clone(),
            row: self.row,
            category: self.category.clone(),
            sub_category: self.sub_category.clone(),
            finding: self.finding.clone(),
            amount: self.amount,
            status: self.status.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub records: Vec<Record>,
    pub dropped_rows: usize,
    /// `None` when the page reported that there is nothing to show.
    pub strategy: Option<TableStrategy>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("{target}: page layout not recognised (tried {})", .tried.join(", "))]
    LayoutMismatch {
        target: Target,
        tried: Vec<&'static str>,
    },
    #[error("{target}: all {dropped} row(s) are missing required fields")]
    MissingFields { target: Target, dropped: usize },
    #[error("{target}: not a findings page")]
    NotFindingsPage { target: Target },
}

/// A GP unit named on a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedUnit {
    pub code: String,
    pub place: Place,
}

/// A gram sabha date offered by a GP-year page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GramSabhaDate {
    /// Form value, sent back upstream to select this date.
    pub value: String,
    pub label: String,
}

/// Ways of finding the findings table, tried in [`TableStrategy::ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStrategy {
    /// First qualifying table at or after a findings heading.
    HeadingText,
    /// First table anywhere whose header row has the required columns.
    ColumnSignature,
}

impl TableStrategy {
    pub const ORDER: [TableStrategy; 2] = [TableStrategy::HeadingText, TableStrategy::ColumnSignature];

    pub fn name(self) -> &'static str {
        match self {
            TableStrategy::HeadingText => "heading-text",
            TableStrategy::ColumnSignature => "column-signature",
        }
    }

    fn locate<'a>(self, document: &'a Html) -> Option<FindingsTable<'a>> {
        match self {
            TableStrategy::HeadingText => FINDINGS_HEADINGS
                .iter()
                .find_map(|heading| locate_after_heading(document, heading)),
            TableStrategy::ColumnSignature => document
                .root_element()
                .descendants()
                .filter_map(ElementRef::wrap)
                .filter(|el| el.value().name() == "table")
                .find_map(FindingsTable::from_table),
        }
    }
}

/// Ways of finding GP units on a listing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStrategy {
    PanchayatLinks,
    PanchayatSelect,
}

impl ListingStrategy {
    pub const ORDER: [ListingStrategy; 2] =
        [ListingStrategy::PanchayatLinks, ListingStrategy::PanchayatSelect];

    pub fn name(self) -> &'static str {
        match self {
            ListingStrategy::PanchayatLinks => "panchayat-links",
            ListingStrategy::PanchayatSelect => "panchayat-select",
        }
    }

    fn locate(self, document: &Html) -> Option<Vec<ListedUnit>> {
        match self {
            ListingStrategy::PanchayatLinks => units_from_links(document),
            ListingStrategy::PanchayatSelect => units_from_select(document),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    GramSabhaDate,
    Category,
    SubCategory,
    Finding,
    Amount,
    Status,
}

fn role_for_header(text: &str) -> Option<Role> {
    let header = text.to_lowercase();
    let is_kind = header.contains("categor") || header.contains("type");
    if header.contains("gram sabha") || header.contains("gs date") {
        Some(Role::GramSabhaDate)
    } else if header.contains("sub") && is_kind {
        Some(Role::SubCategory)
    } else if header.contains("categor") || header.contains("issue type") {
        Some(Role::Category)
    } else if header.contains("description")
        || header.contains("finding")
        || header.contains("details")
    {
        Some(Role::Finding)
    } else if header.contains("amount") {
        Some(Role::Amount)
    } else if header.contains("status") || header.contains("action taken") {
        Some(Role::Status)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnMap {
    category: usize,
    finding: usize,
    sub_category: Option<usize>,
    amount: Option<usize>,
    status: Option<usize>,
    gs_date: Option<usize>,
}

impl ColumnMap {
    fn from_header(cells: &[String]) -> Option<Self> {
        let mut category = None;
        let mut finding = None;
        let mut sub_category = None;
        let mut amount = None;
        let mut status = None;
        let mut gs_date = None;

        for (idx, cell) in cells.iter().enumerate() {
            let slot = match role_for_header(cell) {
                Some(Role::GramSabhaDate) => &mut gs_date,
                Some(Role::Category) => &mut category,
                Some(Role::SubCategory) => &mut sub_category,
                Some(Role::Finding) => &mut finding,
                Some(Role::Amount) => &mut amount,
                Some(Role::Status) => &mut status,
                None => continue,
            };
            slot.get_or_insert(idx);
        }

        Some(Self {
            category: category?,
            finding: finding?,
            sub_category,
            amount,
            status,
            gs_date,
        })
    }
}

struct FindingsTable<'a> {
    columns: ColumnMap,
    data_rows: Vec<ElementRef<'a>>,
}

impl<'a> FindingsTable<'a> {
    fn from_table(table: ElementRef<'a>) -> Option<Self> {
        let rows = table_rows(table);
        let (header_idx, columns) = rows
            .iter()
            .enumerate()
            .find_map(|(idx, row)| ColumnMap::from_header(&row_cells(*row)).map(|c| (idx, c)))?;

        Some(Self {
            columns,
            data_rows: rows[header_idx + 1..].to_vec(),
        })
    }
}

fn locate_after_heading<'a>(document: &'a Html, heading: &str) -> Option<FindingsTable<'a>> {
    let mut armed = false;
    for element in document.root_element().descendants().filter_map(ElementRef::wrap) {
        if has_heading(element, heading) {
            if element.value().name() == "caption" {
                let table = element.parent().and_then(ElementRef::wrap);
                if let Some(found) = table.and_then(FindingsTable::from_table) {
                    return Some(found);
                }
            }
            armed = true;
            continue;
        }

        if armed && element.value().name() == "table" {
            if let Some(found) = FindingsTable::from_table(element) {
                return Some(found);
            }
        }
    }
    None
}

/// Whether the element's own text carries `heading`. Document metadata
/// (`<title>` and the rest of `<head>`) never counts.
fn has_heading(element: ElementRef<'_>, heading: &str) -> bool {
    if matches!(element.value().name(), "head" | "title" | "script" | "style")
        || element
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|ancestor| ancestor.value().name() == "head")
    {
        return false;
    }
    element
        .children()
        .filter_map(|child| child.value().as_text().map(|text| &**text))
        .collect::<String>()
        .to_lowercase()
        .contains(heading)
}

/// Direct rows of `table`, skipping rows of nested tables.
fn table_rows(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    let mut rows = Vec::new();
    for child in table.children().filter_map(ElementRef::wrap) {
        match child.value().name() {
            "tr" => rows.push(child),
            "thead" | "tbody" | "tfoot" => rows.extend(
                child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|el| el.value().name() == "tr"),
            ),
            _ => {}
        }
    }
    rows
}

fn row_cells(row: ElementRef<'_>) -> Vec<String> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "td" | "th"))
        .map(|cell| normalize_ws(&cell.text().collect::<String>()))
        .collect()
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_ignorable_row(cells: &[String]) -> bool {
    cells.len() <= 1
        || cells.iter().all(|cell| cell.is_empty())
        || cells.iter().any(|cell| {
            let cell = cell.to_lowercase();
            cell == "total" || cell == "grand total"
        })
}

/// `Ok(None)` for a blank cell, `Err` for anything that is not a finite number.
fn parse_amount(text: &str) -> Result<Option<f64>, ()> {
    let cleaned = text
        .trim()
        .trim_start_matches('₹')
        .trim_start_matches("Rs.")
        .trim_start_matches("Rs")
        .replace(',', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "-" {
        return Ok(None);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|amount| amount.is_finite())
        .map(Some)
        .ok_or(())
}

fn record_from_cells(
    key: &Key,
    row: usize,
    columns: &ColumnMap,
    cells: &[String],
    page_date: Option<&str>,
) -> Option<Record> {
    let required = |idx: usize| cells.get(idx).filter(|cell| !cell.is_empty()).cloned();
    let optional = |idx: Option<usize>| {
        idx.and_then(|idx| cells.get(idx))
            .filter(|cell| !cell.is_empty())
            .cloned()
    };

    let category = required(columns.category)?;
    let finding = required(columns.finding)?;
    let amount = match optional(columns.amount) {
        Some(text) => parse_amount(&text).ok()?,
        None => None,
    };

    Some(Record {
        key: key.clone(),
        place: Place::default(),
        gs_date: optional(columns.gs_date).or_else(|| page_date.map(str::to_owned)),
        row,
        category,
        sub_category: optional(columns.sub_category),
        finding,
        amount,
        status: optional(columns.status),
    })
}

fn reports_no_records(document: &Html) -> bool {
    let text = document.root_element().text().collect::<String>().to_lowercase();
    let text = normalize_ws(&text);
    NO_RECORD_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Extracts findings records from a GP-year or gram sabha page.
pub fn parse(page: &RawPage) -> Result<Parsed, ParseError> {
    let key = match &page.target {
        Target::GpYear(key) | Target::GramSabha { key, .. } => key,
        Target::Listing { .. } => {
            return Err(ParseError::NotFindingsPage {
                target: page.target.clone(),
            });
        }
    };

    let document = Html::parse_document(&page.html);
    let located = TableStrategy::ORDER
        .into_iter()
        .find_map(|strategy| strategy.locate(&document).map(|table| (strategy, table)));

    let Some((strategy, table)) = located else {
        if reports_no_records(&document) {
            return Ok(Parsed {
                records: Vec::new(),
                dropped_rows: 0,
                strategy: None,
            });
        }
        return Err(ParseError::LayoutMismatch {
            target: page.target.clone(),
            tried: TableStrategy::ORDER.map(TableStrategy::name).to_vec(),
        });
    };

    let page_date = chosen_label(&document, "gsdate");
    let mut records = Vec::new();
    let mut dropped_rows = 0_usize;
    for (idx, row) in table.data_rows.iter().enumerate() {
        let cells = row_cells(*row);
        if is_ignorable_row(&cells) {
            continue;
        }
        match record_from_cells(key, idx + 1, &table.columns, &cells, page_date.as_deref()) {
            Some(record) => records.push(record),
            None => dropped_rows += 1,
        }
    }

    if records.is_empty() && dropped_rows > 0 {
        return Err(ParseError::MissingFields {
            target: page.target.clone(),
            dropped: dropped_rows,
        });
    }

    Ok(Parsed {
        records,
        dropped_rows,
        strategy: Some(strategy),
    })
}

/// Gram sabha dates a GP-year page offers, in page order. Empty when the
/// page has no date selector.
pub fn gram_sabha_dates(page: &RawPage) -> Vec<GramSabhaDate> {
    let document = Html::parse_document(&page.html);
    let Some(select) = find_select(&document, "gsdate") else {
        return Vec::new();
    };
    let mut dates = select_options(select)
        .into_iter()
        .map(|option| GramSabhaDate {
            value: option.value,
            label: option.label,
        })
        .collect::<Vec<_>>();
    dates.dedup_by(|a, b| a.value == b.value);
    dates
}

/// Extracts the GP units of a listing page, sorted and de-duplicated by code.
pub fn parse_listing(page: &RawPage) -> Result<Vec<ListedUnit>, ParseError> {
    let document = Html::parse_document(&page.html);
    let found = ListingStrategy::ORDER
        .into_iter()
        .find_map(|strategy| strategy.locate(&document));

    let mut units = match found {
        Some(units) => units,
        None if reports_no_records(&document) => Vec::new(),
        None => {
            return Err(ParseError::LayoutMismatch {
                target: page.target.clone(),
                tried: ListingStrategy::ORDER.map(ListingStrategy::name).to_vec(),
            });
        }
    };
    units.sort_by(|a, b| a.code.cmp(&b.code));
    units.dedup_by(|a, b| a.code == b.code);
    Ok(units)
}

fn units_from_links(document: &Html) -> Option<Vec<ListedUnit>> {
    let base = Url::parse("http://listing.invalid/").ok()?;
    let units = document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "a")
        .filter_map(|link| {
            let url = base.join(link.value().attr("href")?).ok()?;
            let param = |name: &str| {
                url.query_pairs()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| normalize_ws(&value))
                    .filter(|value| !value.is_empty())
            };
            let code = param("panchayat_code")?;
            let text = normalize_ws(&link.text().collect::<String>());
            Some(ListedUnit {
                code,
                place: Place {
                    district: param("district_name"),
                    block: param("block_name"),
                    panchayat: param("panchayat_name").or((!text.is_empty()).then_some(text)),
                },
            })
        })
        .collect::<Vec<_>>();

    (!units.is_empty()).then_some(units)
}

fn units_from_select(document: &Html) -> Option<Vec<ListedUnit>> {
    let options = select_options(find_select(document, "panchayat")?);
    // the form only fills this select once a district and block are chosen
    if options.is_empty() {
        return None;
    }

    let district = chosen_label(document, "district");
    let block = chosen_label(document, "block");
    let units = options
        .into_iter()
        .map(|option| ListedUnit {
            code: option.value,
            place: Place {
                district: district.clone(),
                block: block.clone(),
                panchayat: Some(option.label).filter(|label| !label.is_empty()),
            },
        })
        .collect();
    Some(units)
}

/// First `<select>` whose id or name contains `needle` (lowercase).
fn find_select<'a>(document: &'a Html, needle: &str) -> Option<ElementRef<'a>> {
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "select")
        .find(|el| {
            ["id", "name"].iter().any(|attr| {
                el.value()
                    .attr(attr)
                    .is_some_and(|value| value.to_lowercase().contains(needle))
            })
        })
}

struct SelectOption {
    value: String,
    label: String,
    selected: bool,
}

/// Options of `select`, without placeholders such as `--Select--` or `ALL`.
fn select_options(select: ElementRef<'_>) -> Vec<SelectOption> {
    select
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "option")
        .map(|option| {
            let label = normalize_ws(&option.text().collect::<String>());
            let value = option
                .value()
                .attr("value")
                .map(|value| value.trim().to_owned())
                .unwrap_or_else(|| label.clone());
            SelectOption {
                value,
                label,
                selected: option.value().attr("selected").is_some(),
            }
        })
        .filter(|option| {
            let value = option.value.to_lowercase();
            !value.starts_with("--")
                && !option.label.starts_with("--")
                && !PLACEHOLDER_OPTIONS.contains(&value.as_str())
        })
        .collect()
}

/// Label of the option a form select currently shows: the selected one, or
/// the only one.
fn chosen_label(document: &Html, needle: &str) -> Option<String> {
    let options = select_options(find_select(document, needle)?);
    let chosen = options
        .iter()
        .find(|option| option.selected)
        .or(match options.as_slice() {
            [only] => Some(only),
            _ => None,
        })?;
    Some(chosen.label.clone()).filter(|label| !label.is_empty())
}
