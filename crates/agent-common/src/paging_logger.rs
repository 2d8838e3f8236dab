// Per-record paging log files. Each execution context opens its logger when
// the record starts and closes it on completion; completed pages are handed
// to a callback for upload queueing.

use anyhow::Result;
use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use uuid::Uuid;

/// Folder name for log pages under the diag directory.
pub const PAGING_FOLDER: &str = "pages";

/// Maximum size of a single log page in bytes (8 MB).
pub const PAGE_SIZE: usize = 8 * 1024 * 1024;

/// Callback invoked when a page file is complete: (timeline id, record id, path).
pub type PageCompleteCallback = Box<dyn Fn(Uuid, Uuid, &str) + Send + Sync>;

/// A logger that writes output to paged log files on disk.
///
/// Each page is capped at `PAGE_SIZE` bytes; when a page fills, a new page
/// file is created and the completed one is reported through the callback.
/// Every line is prefixed with a UTC timestamp. The file handle is released
/// on `end` and unconditionally on drop.
pub struct PagingLogger {
    timeline_id: Uuid,
    timeline_record_id: Uuid,

    pages_folder: PathBuf,
    page_writer: Option<BufWriter<File>>,
    page_data_file: Option<PathBuf>,
    page_byte_count: usize,
    page_count: u32,

    total_lines: u64,

    on_page_complete: Option<PageCompleteCallback>,
}

impl PagingLogger {
    /// Create a new `PagingLogger` rooted in the given diag directory.
    pub fn new(
        diag_directory: &std::path::Path,
        timeline_id: Uuid,
        timeline_record_id: Uuid,
    ) -> Result<Self> {
        let pages_folder = diag_directory.join(PAGING_FOLDER);
        fs::create_dir_all(&pages_folder)?;

        Ok(Self {
            timeline_id,
            timeline_record_id,
            pages_folder,
            page_writer: None,
            page_data_file: None,
            page_byte_count: 0,
            page_count: 0,
            total_lines: 0,
            on_page_complete: None,
        })
    }

    /// Set the callback invoked when a page file is complete.
    pub fn set_on_page_complete<F>(&mut self, callback: F)
    where
        F: Fn(Uuid, Uuid, &str) + Send + Sync + 'static,
    {
        self.on_page_complete = Some(Box::new(callback));
    }

    /// Get the total number of lines written.
    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Write a message to the log, prefixed with a UTC timestamp.
    pub fn write(&mut self, message: &str) {
        // Lazy creation on first write
        if self.page_writer.is_none() {
            self.new_page();
        }

        let line = format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.7fZ"), message);

        if let Some(ref mut writer) = self.page_writer {
            let _ = writeln!(writer, "{}", line);
        }

        // Count lines, including any embedded newlines.
        self.total_lines += 1;
        self.total_lines += line.chars().filter(|&c| c == '\n').count() as u64;

        self.page_byte_count += line.len() + 1;
        if self.page_byte_count >= PAGE_SIZE {
            self.new_page();
        }
    }

    /// Finalize the logger, flushing and closing the open page.
    pub fn end(&mut self) {
        self.end_page();
    }

    fn new_page(&mut self) {
        self.end_page();
        self.page_byte_count = 0;
        self.page_count += 1;

        let file_name = format!(
            "{}_{}_{}.log",
            self.timeline_id, self.timeline_record_id, self.page_count
        );
        let path = self.pages_folder.join(&file_name);

        match File::create(&path) {
            Ok(file) => {
                self.page_writer = Some(BufWriter::new(file));
                self.page_data_file = Some(path);
            }
            Err(e) => {
                tracing::error!("Failed to create page file {:?}: {}", path, e);
            }
        }
    }

    fn end_page(&mut self) {
        if let Some(mut writer) = self.page_writer.take() {
            let _ = writer.flush();
        }
        if let Some(ref path) = self.page_data_file.take() {
            if let Some(ref callback) = self.on_page_complete {
                callback(
                    self.timeline_id,
                    self.timeline_record_id,
                    path.to_str().unwrap_or(""),
                );
            }
        }
    }
}

impl Drop for PagingLogger {
    fn drop(&mut self) {
        self.end();
    }
}
