// Parent location and separator maintenance. Included by mod.rs.
//
// Pages carry no parent link. The pointer for a child is found by descending
// from the root to one level above the child with a key the child covers;
// separators are lower bounds of their subtrees, so that descent always lands
// on the child's own pointer, and anything else is corruption. The one
// exception is the min-rec pointer: descent clamps to it for any key below
// its separator, so its key is effectively minus infinity and carries no
// bound on the leftmost subtree.

impl BTreeIndex {
    /// Find the node pointer leading to `child` at `child_level`, descending
    /// with `search_key` (a key that is or was covered by the child). The
    /// whole path down to the parent is X-latched; the caller holds the tree
    /// SX latch. Returns the parent handle and the pointer's slot.
    fn find_parent(
        &self,
        mtr: &mut Mtr,
        child: PageId,
        child_level: u16,
        search_key: &[u8],
    ) -> Result<(PageHandle, usize)> {
        let (h, header) =
            self.descend_to_level(mtr, search_key, child_level + 1, LatchMode::X, true)?;
        let page_no = mtr.page_id(h)?;
        let slot = {
            let payload = page::payload(mtr.page_bytes(h)?);
            let extents = SlotExtents::parse(payload, &header)
                .map_err(|_| self.corrupt(page_no, "slot directory undecodable"))?;
            if extents.is_empty() {
                return Err(self.corrupt(page_no, "parent page without pointers"));
            }
            let slot = cursor::descend_slot(payload, &header, &extents, search_key)?;
            let ext = extents.get(slot)?;
            let ptr = page::decode_node_ptr(page::record(payload, &ext))
                .map_err(|_| self.corrupt(page_no, "node pointer undecodable"))?;
            if ptr.child != child {
                return Err(self.corrupt(page_no, "node pointer does not lead to child"));
            }
            slot
        };
        Ok((h, slot))
    }

    /// Rewrite the child id of the pointer at `slot` in place. Used when a
    /// merge keeps the separator but moves the subtree.
    fn set_node_ptr_child(
        &self,
        mtr: &mut Mtr,
        parent: PageHandle,
        slot: usize,
        child: PageId,
    ) -> Result<()> {
        let page_no = mtr.page_id(parent)?;
        let ext = {
            let payload = page::payload(mtr.page_bytes(parent)?);
            let header = Header::parse(payload)
                .map_err(|_| self.corrupt(page_no, "payload header undecodable"))?;
            SlotExtents::parse(payload, &header)
                .map_err(|_| self.corrupt(page_no, "slot directory undecodable"))?
                .get(slot)?
        };
        {
            let frame = mtr.frame_mut(parent)?;
            page::rewrite_node_ptr_child(page::payload_mut(&mut frame.buf), &ext, child)?;
        }
        mtr.log(RedoOp::NodePtrChild, page_no, &child.0.to_be_bytes());
        self.refresh_twin(mtr, parent)?;
        Ok(())
    }

    /// Insert a separator `sep_key -> child` into the parent of `left_child`,
    /// splitting the parent level when it is full. `left_key` is a key the
    /// left child covers and anchors the parent search.
    fn insert_node_ptr(
        &self,
        mtr: &mut Mtr,
        left_child: PageId,
        child_level: u16,
        left_key: &[u8],
        sep_key: &[u8],
        child: PageId,
    ) -> Result<()> {
        let (parent, slot) = self.find_parent(mtr, left_child, child_level, left_key)?;
        let entry = RecEntry::NodePtr {
            info: 0,
            key: sep_key.to_vec(),
            child,
        };
        let (header, mut entries) = self.snapshot_page(mtr, parent)?;
        entries.insert(slot + 1, entry.clone());
        page::apply_min_rec_rule(&mut entries, header.level, header.prev.is_some());
        match page::build_layout(self.payload_len(), entries)? {
            Some(layout) => {
                self.rewrite_page(mtr, parent, &header, &layout, RedoOp::RecordInsert)?;
                self.refresh_twin(mtr, parent)?;
                Ok(())
            }
            None => self.split_and_insert(mtr, parent, entry),
        }
    }

    /// Remove the pointer at `slot` of `parent`, then shrink the parent if it
    /// fell under the merge threshold or became a sole-pointer root.
    fn delete_node_ptr(
        &self,
        mtr: &mut Mtr,
        parent: PageHandle,
        slot: usize,
        anchor_key: &[u8],
    ) -> Result<()> {
        let page_no = mtr.page_id(parent)?;
        let (header, mut entries) = self.snapshot_page(mtr, parent)?;
        if slot >= entries.len() {
            return Err(self.corrupt(page_no, "node pointer slot out of range"));
        }
        entries.remove(slot);
        page::apply_min_rec_rule(&mut entries, header.level, header.prev.is_some());
        let payload_len = self.payload_len();
        let remaining = entries.len();
        let layout = page::build_layout(payload_len, entries)?
            .ok_or_else(|| self.corrupt(page_no, "records overflow their own page"))?;
        let occupied = layout.data_size();
        self.rewrite_page(mtr, parent, &header, &layout, RedoOp::RecordDelete)?;
        self.refresh_twin(mtr, parent)?;
        if page_no == self.root_page() {
            if remaining == 1 {
                self.lift_sole_children(mtr)?;
            }
        } else if page::fill_pct(payload_len, occupied) < self.options.merge_threshold {
            let _ = self.try_compress(mtr, parent, anchor_key)?;
        }
        Ok(())
    }
}
