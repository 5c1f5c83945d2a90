//! Record command handlers

use anyhow::{Context, Result};

use cams_core::{Catalog, Record, RecordId};

use crate::output::Output;
use crate::prompt::{confirm, parse_tags, with_default};
use crate::remote::Remote;

/// Fields for a new record
pub struct NewRecord {
    pub english: String,
    pub chinese: String,
    pub tags: Vec<String>,
    pub image: Option<String>,
    pub favorite: bool,
}

/// Changes to an existing record; all empty means interactive editing
#[derive(Default)]
pub struct RecordChanges {
    pub english: Option<String>,
    pub chinese: Option<String>,
    pub image: Option<String>,
    pub tags: Option<Vec<String>>,
    pub add_tags: Vec<String>,
    pub remove_tags: Vec<String>,
}

impl RecordChanges {
    fn is_empty(&self) -> bool {
        self.english.is_none()
            && self.chinese.is_none()
            && self.image.is_none()
            && self.tags.is_none()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
    }

    fn apply(self, record: &mut Record) {
        if let Some(english) = self.english {
            record.set_english(english);
        }
        if let Some(chinese) = self.chinese {
            record.set_chinese(chinese);
        }
        if let Some(image) = self.image {
            record.set_image(Some(image));
        }
        if let Some(tags) = self.tags {
            record.set_tags(tags);
        }
        for tag in self.add_tags {
            record.add_tag(tag);
        }
        for tag in &self.remove_tags {
            record.remove_tag(tag);
        }
    }
}

/// Add a record
pub async fn add(
    catalog: &Catalog,
    remote: &mut Remote,
    fields: NewRecord,
    output: &Output,
) -> Result<()> {
    let mut record = Record::new(fields.english.trim(), fields.chinese.trim());
    record.set_tags(fields.tags);
    record.set_image(fields.image);
    record.favorite = fields.favorite;

    let records = catalog.add(record.clone())?;
    remote.push(records, output).await;

    output.success(&format!("Added record: {}", record.id));
    output.print_record(&record);
    Ok(())
}

/// List records, optionally filtered
pub fn list(
    catalog: &Catalog,
    tag: Option<String>,
    favorites: bool,
    output: &Output,
) -> Result<()> {
    let mut records = match tag {
        Some(ref t) => catalog.list_by_tag(t)?,
        None => catalog.list()?,
    };
    if favorites {
        records.retain(|r| r.favorite);
    }

    output.print_records(&records);
    Ok(())
}

/// Search by English name, Chinese name or tag
pub fn search(catalog: &Catalog, query: String, output: &Output) -> Result<()> {
    let records = catalog.search(&query)?;
    output.print_records(&records);
    Ok(())
}

/// Show a single record
pub fn show(catalog: &Catalog, id: String, output: &Output) -> Result<()> {
    let record = find(catalog, &id)?;
    output.print_record(&record);
    Ok(())
}

/// Edit a record from flags, or interactively when no flag is given
pub async fn edit(
    catalog: &Catalog,
    remote: &mut Remote,
    id: String,
    changes: RecordChanges,
    output: &Output,
) -> Result<()> {
    let mut record = find(catalog, &id)?;

    if changes.is_empty() {
        edit_interactive(&mut record)?;
    } else {
        changes.apply(&mut record);
    }

    let records = catalog
        .update(record.clone())
        .context("Failed to update record")?;
    remote.push(records, output).await;

    output.success("Record updated");
    if let Some(updated) = catalog.get(record.id)? {
        output.print_record(&updated);
    }
    Ok(())
}

fn edit_interactive(record: &mut Record) -> Result<()> {
    println!("Editing record: {}", record.id);
    println!("Press Enter to keep current value, or type new value.\n");

    if let Some(english) = with_default("English", &record.english)? {
        record.set_english(english);
    }
    if let Some(chinese) = with_default("Chinese", &record.chinese)? {
        record.set_chinese(chinese);
    }
    let image = record.image.clone().unwrap_or_default();
    if let Some(image) = with_default("Image", &image)? {
        record.set_image(Some(image));
    }
    if let Some(tags) = with_default("Tags (comma-separated)", &record.tags.join(", "))? {
        record.set_tags(parse_tags(&tags));
    }
    Ok(())
}

/// Toggle the favorite flag
pub async fn favorite(
    catalog: &Catalog,
    remote: &mut Remote,
    id: String,
    output: &Output,
) -> Result<()> {
    let record = find(catalog, &id)?;
    let (favorite, records) = catalog.toggle_favorite(record.id)?;
    remote.push(records, output).await;

    let verb = if favorite { "Marked" } else { "Unmarked" };
    output.success(&format!("{} {} as favorite", verb, record.english));
    Ok(())
}

/// Remove a record
pub async fn remove(
    catalog: &Catalog,
    remote: &mut Remote,
    id: String,
    yes: bool,
    output: &Output,
) -> Result<()> {
    let record = find(catalog, &id)?;

    if !yes && output.should_prompt() {
        println!("Delete record: {} ({})", record.english, record.chinese);
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let (removed, records) = catalog
        .remove(record.id)
        .context("Failed to delete record")?;
    remote.push(records, output).await;

    output.success(&format!("Deleted record: {}", removed.id));
    Ok(())
}

/// Delete every record
pub async fn clear(
    catalog: &Catalog,
    remote: &mut Remote,
    yes: bool,
    output: &Output,
) -> Result<()> {
    let count = catalog.count()?;
    if count == 0 {
        output.message("Catalog is already empty.");
        return Ok(());
    }

    if !yes && !confirm(&format!("Delete all {} record(s)?", count))? {
        output.message("Cancelled. Use --yes to skip confirmation.");
        return Ok(());
    }

    let records = catalog.clear()?;
    remote.push(records, output).await;

    output.success(&format!("Deleted {} record(s)", count));
    Ok(())
}

/// List all tags with usage counts
pub fn tags(catalog: &Catalog, output: &Output) -> Result<()> {
    let tags = catalog.tags_with_counts()?;
    output.print_tags(&tags);
    Ok(())
}

/// Look up a record by exact id, or by unique id prefix
fn find(catalog: &Catalog, id: &str) -> Result<Record> {
    if let Ok(record_id) = id.parse::<RecordId>() {
        if let Some(record) = catalog.get(record_id)? {
            return Ok(record);
        }
    }

    let records = catalog.list()?;
    let matches = match_prefix(&records, id);

    match matches.len() {
        0 => anyhow::bail!("No record found matching: {}", id),
        1 => Ok(matches[0].clone()),
        _ => {
            eprintln!("Multiple records match '{}':", id);
            for record in &matches {
                eprintln!("  {} - {} ({})", record.id, record.english, record.chinese);
            }
            anyhow::bail!("Ambiguous ID. Please provide more characters.");
        }
    }
}

fn match_prefix<'a>(records: &'a [Record], prefix: &str) -> Vec<&'a Record> {
    records
        .iter()
        .filter(|r| r.id.to_string().starts_with(prefix))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_apply() {
        let mut record = Record::with_id(RecordId::from_millis(1), "Yang Mi", "杨幂");
        record.add_tag("drama");
        record.add_tag("film");

        RecordChanges {
            english: Some("Yáng Mì".to_string()),
            add_tags: vec!["idol".to_string()],
            remove_tags: vec!["film".to_string()],
            ..RecordChanges::default()
        }
        .apply(&mut record);

        assert_eq!(record.english, "Yáng Mì");
        assert_eq!(record.phonetic_key, "yang mi");
        assert_eq!(record.chinese, "杨幂");
        assert_eq!(record.tags, vec!["drama", "idol"]);
    }

    #[test]
    fn test_changes_empty() {
        assert!(RecordChanges::default().is_empty());
        let changes = RecordChanges {
            tags: Some(Vec::new()),
            ..RecordChanges::default()
        };
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_match_prefix() {
        let records = vec![
            Record::with_id(RecordId::from_millis(1700000000001), "A", "甲"),
            Record::with_id(RecordId::from_millis(1700000000002), "B", "乙"),
            Record::with_id(RecordId::from_millis(1600000000000), "C", "丙"),
        ];
        assert_eq!(match_prefix(&records, "17").len(), 2);
        assert_eq!(match_prefix(&records, "1700000000002").len(), 1);
        assert!(match_prefix(&records, "9").is_empty());
    }
}
