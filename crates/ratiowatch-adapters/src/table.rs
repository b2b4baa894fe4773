//! Document-order table walking.

use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

/// One `<table>` element and the cell text of every row beneath it.
#[derive(Debug, Clone)]
pub struct TableGroup<'a> {
    pub index: usize,
    pub element: ElementRef<'a>,
    pub rows: Vec<Vec<String>>,
}

/// Walks a parsed document and yields its tables in encounter order.
///
/// Nested tables are yielded as their own groups and their rows also appear in the
/// enclosing table's rows. Nothing is filtered here.
#[derive(Debug, Clone)]
pub struct TableExtractor {
    table: Selector,
    row: Selector,
    cell: Selector,
}

impl TableExtractor {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            table: parse_selector("table")?,
            row: parse_selector("tr")?,
            cell: parse_selector("td, th")?,
        })
    }

    pub fn tables<'a>(&'a self, document: &'a Html) -> impl Iterator<Item = TableGroup<'a>> + 'a {
        document
            .select(&self.table)
            .enumerate()
            .map(move |(index, element)| TableGroup {
                index,
                element,
                rows: self.rows_of(element),
            })
    }

    fn rows_of(&self, table: ElementRef<'_>) -> Vec<Vec<String>> {
        table
            .select(&self.row)
            .map(|row| row.select(&self.cell).map(cell_text).collect())
            .collect()
    }
}

pub(crate) fn parse_selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(format!("{css}: {e}")))
}

/// Trims every text fragment and joins the non-empty ones without a separator.
pub fn cell_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
