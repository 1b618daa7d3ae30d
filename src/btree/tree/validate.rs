// The consistency validator. Included by mod.rs.

/// Severity of a validation finding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum Severity {
    /// Suspicious but legal; the tree remains usable.
    Warning,
    /// An invariant violation.
    Error,
}

/// One problem found by [`BTreeIndex::validate`].
#[derive(Clone, Debug, Serialize)]
pub struct Finding {
    /// How bad it is.
    pub severity: Severity,
    /// The page the finding is about.
    pub page: u64,
    /// Human-readable description.
    pub message: String,
}

/// Outcome of a full-tree consistency walk.
#[derive(Clone, Debug, Serialize)]
pub struct ValidateReport {
    /// Whether the walk found no errors (warnings do not fail a tree).
    pub success: bool,
    /// Pages visited.
    pub pages_checked: u64,
    /// Everything found, in walk order.
    pub findings: Vec<Finding>,
}

struct Validation {
    findings: Vec<Finding>,
    pages_checked: u64,
}

impl Validation {
    fn report(&mut self, severity: Severity, page: PageId, message: String) {
        tracing::warn!(
            target: "cedar::btree::validate",
            page = page.0,
            ?severity,
            %message,
            "validation finding"
        );
        self.findings.push(Finding {
            severity,
            page: page.0,
            message,
        });
    }

    fn error(&mut self, page: PageId, message: String) {
        self.report(Severity::Error, page, message);
    }

    fn warn(&mut self, page: PageId, message: String) {
        self.report(Severity::Warning, page, message);
    }
}

impl BTreeIndex {
    /// Walk the whole tree level by level under the SX latch, collecting
    /// every finding instead of stopping at the first. Readers stay admitted;
    /// structural writers are held off so the shape cannot move underfoot.
    pub fn validate(&self) -> Result<ValidateReport> {
        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::Sx);
        let root = self.root_page();
        if root.0 == 0 {
            mtr.commit()?;
            return Err(Error::Invalid("index tree is not created"));
        }
        let mut v = Validation {
            findings: Vec::new(),
            pages_checked: 0,
        };
        let sp = mtr.savepoint();
        let root_level = match self.latch_page_checked(&mut mtr, root, LatchMode::S) {
            Ok((_, rheader)) => Some(rheader.level),
            Err(err) => {
                v.error(root, format!("root unusable: {err}"));
                None
            }
        };
        mtr.release_to(sp);
        if let Some(root_level) = root_level {
            for level in (0..=root_level).rev() {
                self.validate_level(&mut mtr, &mut v, root, level)?;
            }
        }
        mtr.commit()?;
        let success = v.findings.iter().all(|f| f.severity != Severity::Error);
        tracing::info!(
            target: "cedar::btree::validate",
            index = self.index_id.0,
            pages = v.pages_checked,
            findings = v.findings.len(),
            success,
            "tree validation finished"
        );
        Ok(ValidateReport {
            success,
            pages_checked: v.pages_checked,
            findings: v.findings,
        })
    }

    fn validate_level(
        &self,
        mtr: &mut Mtr,
        v: &mut Validation,
        root: PageId,
        level: u16,
    ) -> Result<()> {
        let mut cur = match self.leftmost_at_level(mtr, level) {
            Ok(first) => Some(first),
            Err(err) => {
                v.error(root, format!("level {level} unreachable: {err}"));
                return Ok(());
            }
        };
        let mut expected_prev: Option<PageId> = None;
        let mut prev_last_key: Option<Vec<u8>> = None;
        while let Some(page_no) = cur {
            v.pages_checked += 1;
            let sp = mtr.savepoint();
            if self.alloc.is_free(page_no) {
                v.error(page_no, "page is linked into the tree but free".into());
            }
            let (h, header) = match self.latch_page_checked(mtr, page_no, LatchMode::S) {
                Ok(ok) => ok,
                Err(err) => {
                    v.error(page_no, format!("page unusable: {err}"));
                    return Ok(());
                }
            };
            if header.level != level {
                v.error(page_no, format!("level {} where {level} expected", header.level));
            }
            if header.prev != expected_prev {
                v.error(page_no, "left sibling link is not symmetric".into());
            }
            let (first_key, last_key) = self.validate_page(mtr, v, h, page_no, &header)?;
            if let (Some(prev_last), Some(first)) = (&prev_last_key, &first_key) {
                if prev_last >= first {
                    v.error(page_no, "keys do not increase across the sibling link".into());
                }
            }
            if page_no != root {
                if first_key.is_none() {
                    v.warn(page_no, "empty non-root page awaiting discard".into());
                }
                if let Some(first) = &first_key {
                    self.validate_parent(mtr, v, page_no, level, first)?;
                }
            }
            // Zip twin, when one is kept.
            match zip::verify(mtr.frame(h)?) {
                Ok(true) => {}
                Ok(false) => v.error(page_no, "compressed twin is stale".into()),
                Err(err) => v.error(page_no, format!("compressed twin unusable: {err}")),
            }
            cur = header.next;
            expected_prev = Some(page_no);
            if last_key.is_some() {
                prev_last_key = last_key;
            }
            mtr.release_to(sp);
        }
        Ok(())
    }

    /// In-page checks. Returns the first and last keys for cross-page order.
    #[allow(clippy::type_complexity)]
    fn validate_page(
        &self,
        mtr: &Mtr,
        v: &mut Validation,
        h: PageHandle,
        page_no: PageId,
        header: &Header,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let payload = page::payload(mtr.page_bytes(h)?);
        let extents = match SlotExtents::parse(payload, header) {
            Ok(extents) => extents,
            Err(err) => {
                v.error(page_no, format!("slot directory unusable: {err}"));
                return Ok((None, None));
            }
        };
        let occupied = extents.data_size();
        let mut first_key = None;
        let mut last_key: Option<Vec<u8>> = None;
        for (slot, ext) in extents.iter().enumerate() {
            let rec = page::record(payload, &ext);
            let (info, key) = if header.is_leaf() {
                match page::decode_leaf_record(rec) {
                    Ok(leaf) => (leaf.info, leaf.key.to_vec()),
                    Err(err) => {
                        v.error(page_no, format!("leaf record {slot} unusable: {err}"));
                        continue;
                    }
                }
            } else {
                match page::decode_node_ptr(rec) {
                    Ok(ptr) => {
                        if self.alloc.is_free(ptr.child) {
                            v.error(page_no, format!("slot {slot} points at a free page"));
                        }
                        (ptr.info, ptr.key.to_vec())
                    }
                    Err(err) => {
                        v.error(page_no, format!("node pointer {slot} unusable: {err}"));
                        continue;
                    }
                }
            };
            let min_rec = info & page::REC_INFO_MIN_REC != 0;
            let expect_min = !header.is_leaf() && header.prev.is_none() && slot == 0;
            if min_rec != expect_min {
                v.error(
                    page_no,
                    format!("min-rec bit misplaced on slot {slot}"),
                );
            }
            if let Some(prev) = &last_key {
                if prev >= &key {
                    v.error(page_no, format!("keys not strictly ascending at slot {slot}"));
                }
            }
            if first_key.is_none() {
                first_key = Some(key.clone());
            }
            last_key = Some(key);
        }
        if page_no != self.root_page()
            && !extents.is_empty()
            && page::fill_pct(payload.len(), occupied) < self.options.merge_threshold
        {
            v.warn(page_no, "page under the merge threshold".into());
        }
        Ok((first_key, last_key))
    }

    /// Check that the parent's pointer leads back here and its separator is a
    /// lower bound of the page's keys.
    fn validate_parent(
        &self,
        mtr: &mut Mtr,
        v: &mut Validation,
        page_no: PageId,
        level: u16,
        first_key: &[u8],
    ) -> Result<()> {
        let sp = mtr.savepoint();
        match self.check_parent_pointer(mtr, page_no, level, first_key) {
            Ok(None) => {}
            Ok(Some((parent_no, message))) => v.error(parent_no, message),
            Err(err) => v.error(page_no, format!("parent pointer not found: {err}")),
        }
        mtr.release_to(sp);
        Ok(())
    }

    fn check_parent_pointer(
        &self,
        mtr: &mut Mtr,
        page_no: PageId,
        level: u16,
        first_key: &[u8],
    ) -> Result<Option<(PageId, String)>> {
        let (parent, slot) = self.find_parent(mtr, page_no, level, first_key)?;
        let parent_no = mtr.page_id(parent)?;
        let payload = page::payload(mtr.page_bytes(parent)?);
        let header = Header::parse(payload)?;
        let extents = SlotExtents::parse(payload, &header)?;
        let ext = extents.get(slot)?;
        let ptr = page::decode_node_ptr(page::record(payload, &ext))?;
        // The min-rec pointer is followed for any key below its separator,
        // so its key bounds nothing; a new tree minimum lands under it
        // without touching the separator.
        if ptr.info & page::REC_INFO_MIN_REC == 0 && ptr.key > first_key {
            return Ok(Some((
                parent_no,
                format!("separator exceeds the first key of page {page_no}"),
            )));
        }
        Ok(None)
    }
}
