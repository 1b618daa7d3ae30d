// The split engine. Included by mod.rs.

impl BTreeIndex {
    /// Place `entry` after the optimistic attempt failed: drop a replaced
    /// record, try the right-sibling fast path, then split. The caller holds
    /// the tree SX latch and the X-latched path through the leaf.
    fn insert_pessimistic(
        &self,
        mtr: &mut Mtr,
        cursor: Cursor,
        exact: bool,
        entry: RecEntry,
    ) -> Result<()> {
        if exact {
            let page_no = mtr.page_id(cursor.page)?;
            let (header, mut entries) = self.snapshot_page(mtr, cursor.page)?;
            entries.remove(cursor.slot);
            let layout = page::build_layout(self.payload_len(), entries)?
                .ok_or_else(|| self.corrupt(page_no, "records overflow their own page"))?;
            self.rewrite_page(mtr, cursor.page, &header, &layout, RedoOp::RecordDelete)?;
        }
        if self.try_fast_path(mtr, cursor.page, &entry)? {
            self.stats.record_fast_path_insert();
            return Ok(());
        }
        self.split_and_insert(mtr, cursor.page, entry)
    }

    /// Rightmost inserts on a full leaf often belong on the next page: if the
    /// right sibling shares this page's parent and has room, place the record
    /// there and pull the sibling's separator down to the new key, avoiding a
    /// split entirely.
    fn try_fast_path(&self, mtr: &mut Mtr, h: PageHandle, entry: &RecEntry) -> Result<bool> {
        let (header, entries) = self.snapshot_page(mtr, h)?;
        if header.level != 0 {
            return Ok(false);
        }
        let Some(next_no) = header.next else {
            return Ok(false);
        };
        let Some(last) = entries.last() else {
            return Ok(false);
        };
        if last.key() >= entry.key() {
            return Ok(false);
        }
        let page_no = mtr.page_id(h)?;
        let anchor = last.key().to_vec();
        let (parent, slot) = self.find_parent(mtr, page_no, header.level, &anchor)?;
        let (pheader, mut pentries) = self.snapshot_page(mtr, parent)?;
        let sibling_slot = slot + 1;
        match pentries.get(sibling_slot) {
            Some(RecEntry::NodePtr { child, .. }) if *child == next_no => {}
            _ => return Ok(false),
        }
        let (rh, rheader) = self.latch_page_checked(mtr, next_no, LatchMode::X)?;
        let (_, mut rentries) = self.snapshot_page(mtr, rh)?;
        rentries.insert(0, entry.clone());
        let payload_len = self.payload_len();
        let Some(rlayout) = page::build_layout(payload_len, rentries)? else {
            mtr.release(rh);
            return Ok(false);
        };
        if let RecEntry::NodePtr { key, .. } = &mut pentries[sibling_slot] {
            *key = entry.key().to_vec();
        }
        let Some(playout) = page::build_layout(payload_len, pentries)? else {
            mtr.release(rh);
            return Ok(false);
        };
        self.rewrite_page(mtr, parent, &pheader, &playout, RedoOp::PageRewrite)?;
        self.refresh_twin(mtr, parent)?;
        self.rewrite_page(mtr, rh, &rheader, &rlayout, RedoOp::RecordInsert)?;
        {
            let frame = mtr.frame_mut(rh)?;
            page::set_last_insert(page::payload_mut(&mut frame.buf), Some(0));
        }
        self.refresh_twin(mtr, rh)?;
        self.update_fill_hint(mtr, rh, &rheader)?;
        tracing::debug!(
            target: "cedar::btree",
            page = page_no.0,
            sibling = next_no.0,
            "rightmost insert placed on right sibling"
        );
        Ok(true)
    }

    /// Split `h` and place `entry`, raising the root first when `h` is the
    /// root and recursing into the parent level for the new separator.
    fn split_and_insert(&self, mtr: &mut Mtr, h: PageHandle, entry: RecEntry) -> Result<()> {
        let mut h = h;
        let mut page_no = mtr.page_id(h)?;
        if page_no == self.root_page() {
            h = self.raise_root(mtr)?;
            page_no = mtr.page_id(h)?;
        }
        let (header, entries) = self.snapshot_page(mtr, h)?;
        let payload_len = self.payload_len();
        let insert_pos = match entries.binary_search_by(|e| e.key().cmp(entry.key())) {
            Ok(_) => return Err(self.corrupt(page_no, "duplicate key during split")),
            Err(pos) => pos,
        };
        let mut combined = entries;
        combined.insert(insert_pos, entry);
        if combined.len() < 2 {
            return Err(Error::Invalid("record does not fit an empty page"));
        }

        // Boundary policy: split at the insertion point for sequential
        // loads, between the two records when only two exist, and at the
        // byte midpoint otherwise.
        let mut split_at = if self.options.seq_split_heuristic
            && header.last_insert.map(|s| s + 1) == Some(insert_pos)
        {
            insert_pos
        } else if combined.len() == 2 {
            1
        } else {
            let total: usize = combined
                .iter()
                .map(|e| e.encoded_len() + page::SLOT_ENTRY_LEN)
                .sum();
            let mut acc = 0usize;
            let mut at = combined.len() - 1;
            for (i, e) in combined.iter().enumerate() {
                acc += e.encoded_len() + page::SLOT_ENTRY_LEN;
                if acc * 2 >= total {
                    at = i + 1;
                    break;
                }
            }
            at
        };
        split_at = split_at.clamp(1, combined.len() - 1);

        let mut attempts = 0usize;
        let (left, left_layout, right, right_layout) = loop {
            let mut left = combined[..split_at].to_vec();
            let mut right = combined[split_at..].to_vec();
            page::apply_min_rec_rule(&mut left, header.level, header.prev.is_some());
            page::apply_min_rec_rule(&mut right, header.level, true);
            let l = page::build_layout(payload_len, left.clone())?;
            let r = page::build_layout(payload_len, right.clone())?;
            match (l, r) {
                (Some(l), Some(r)) => break (left, l, right, r),
                (None, _) if split_at > 1 => split_at -= 1,
                (_, None) if split_at < combined.len() - 1 => split_at += 1,
                _ => return Err(Error::Invalid("record does not fit a split half")),
            }
            attempts += 1;
            if attempts > self.options.max_split_retries + combined.len() {
                return Err(Error::Invalid("split boundary would not balance"));
            }
        };

        let class = if header.level == 0 {
            SegClass::Leaf
        } else {
            SegClass::NonLeaf
        };
        // The new page is always the right half; the allocation direction
        // follows the side the insert is heading to.
        let dir = if insert_pos < split_at {
            AllocDirection::Down
        } else {
            AllocDirection::Up
        };
        let new_no = self.alloc.alloc(class, Some(page_no), dir)?;
        let frame = self.cache.install(new_no)?;
        let nh = mtr.latch_page(new_no, frame, LatchMode::X)?;
        self.init_page(mtr, nh, new_no, header.level)?;

        let left_hdr = Header {
            next: Some(new_no),
            ..header.clone()
        };
        let right_hdr = Header {
            prev: Some(page_no),
            next: header.next,
            ..header.clone()
        };
        self.rewrite_page(mtr, h, &left_hdr, &left_layout, RedoOp::PageRewrite)?;
        self.rewrite_page(mtr, nh, &right_hdr, &right_layout, RedoOp::PageRewrite)?;
        if let Some(old_next) = header.next {
            self.relink_prev(mtr, old_next, Some(new_no))?;
        }
        self.observer.move_locks(page_no, new_no);
        self.observer.drop_hash_index(page_no);
        let (target, local_slot) = if insert_pos < split_at {
            (h, insert_pos)
        } else {
            (nh, insert_pos - split_at)
        };
        {
            let frame = mtr.frame_mut(target)?;
            page::set_last_insert(page::payload_mut(&mut frame.buf), Some(local_slot));
        }
        self.refresh_twin(mtr, h)?;
        self.refresh_twin(mtr, nh)?;
        if header.level == 0 {
            self.stats.record_leaf_split();
            self.update_fill_hint(mtr, h, &left_hdr)?;
            self.update_fill_hint(mtr, nh, &right_hdr)?;
        } else {
            self.stats.record_nonleaf_split();
        }
        let left_anchor = left[0].key().to_vec();
        let sep = right[0].key().to_vec();
        tracing::debug!(
            target: "cedar::btree",
            page = page_no.0,
            new = new_no.0,
            level = header.level,
            left = left.len(),
            right = right.len(),
            "page split"
        );
        self.insert_node_ptr(mtr, page_no, header.level, &left_anchor, &sep, new_no)
    }

    /// Grow the tree by one level while keeping the root's page id: move the
    /// root's records to a fresh page and leave a single min-rec pointer
    /// behind. Returns the handle of the new child.
    fn raise_root(&self, mtr: &mut Mtr) -> Result<PageHandle> {
        let root = self.root_page();
        let (rh, rheader) = self.latch_page_checked(mtr, root, LatchMode::X)?;
        let (_, mut entries) = self.snapshot_page(mtr, rh)?;
        if entries.is_empty() {
            return Err(self.corrupt(root, "raising an empty root"));
        }
        let class = if rheader.level == 0 {
            SegClass::Leaf
        } else {
            SegClass::NonLeaf
        };
        let child_no = self.alloc.alloc(class, Some(root), AllocDirection::Any)?;
        let frame = self.cache.install(child_no)?;
        let ch = mtr.latch_page(child_no, frame, LatchMode::X)?;
        self.init_page(mtr, ch, child_no, rheader.level)?;
        page::apply_min_rec_rule(&mut entries, rheader.level, false);
        let payload_len = self.payload_len();
        let first_key = entries[0].key().to_vec();
        let child_hdr = Header {
            prev: None,
            next: None,
            ..rheader.clone()
        };
        let layout = page::build_layout(payload_len, entries)?
            .ok_or_else(|| self.corrupt(root, "root records overflow a fresh page"))?;
        self.rewrite_page(mtr, ch, &child_hdr, &layout, RedoOp::PageRewrite)?;
        self.observer.move_locks(root, child_no);
        self.observer.drop_hash_index(root);
        let mut ptr = vec![RecEntry::NodePtr {
            info: 0,
            key: first_key,
            child: child_no,
        }];
        page::apply_min_rec_rule(&mut ptr, rheader.level + 1, false);
        let root_hdr = Header {
            level: rheader.level + 1,
            prev: None,
            next: None,
            ..rheader
        };
        let root_layout = page::build_layout(payload_len, ptr)?
            .ok_or_else(|| self.corrupt(root, "node pointer overflows the root"))?;
        self.rewrite_page(mtr, rh, &root_hdr, &root_layout, RedoOp::RootRaise)?;
        self.refresh_twin(mtr, ch)?;
        self.refresh_twin(mtr, rh)?;
        if root_hdr.level == 1 {
            self.update_fill_hint(mtr, ch, &child_hdr)?;
        }
        self.stats.record_root_raise();
        tracing::info!(
            target: "cedar::btree",
            index = self.index_id.0,
            root = root.0,
            child = child_no.0,
            level = root_hdr.level,
            "root raised"
        );
        Ok(ch)
    }
}
