// The merge engine: sibling merges, sole-child lifts, empty-page discards.
// Included by mod.rs.

impl BTreeIndex {
    /// Merge `h` into a sibling when the combined records fit one page, or
    /// collapse the sole-child chain when it has no siblings. `anchor_key` is
    /// a key the page covers or covered and anchors parent searches. The
    /// caller holds the tree SX latch and the X-latched path through `h`.
    fn try_compress(&self, mtr: &mut Mtr, h: PageHandle, anchor_key: &[u8]) -> Result<MergeOutcome> {
        let page_no = mtr.page_id(h)?;
        if page_no == self.root_page() {
            return Ok(MergeOutcome::Declined);
        }
        let (header, entries) = self.snapshot_page(mtr, h)?;
        if header.prev.is_none() && header.next.is_none() {
            self.lift_sole_children(mtr)?;
            return Ok(MergeOutcome::Lifted);
        }
        let payload_len = self.payload_len();
        let class = if header.level == 0 {
            SegClass::Leaf
        } else {
            SegClass::NonLeaf
        };
        let (parent, slot) = self.find_parent(mtr, page_no, header.level, anchor_key)?;
        let (_, pentries) = self.snapshot_page(mtr, parent)?;

        // Left sibling first: the page's records append cleanly after the
        // sibling's and the survivor keeps its separator.
        if let Some(left_no) = header.prev {
            if slot > 0 {
                match &pentries[slot - 1] {
                    RecEntry::NodePtr { child, .. } if *child == left_no => {
                        let (lh, lheader) = self.latch_page_checked(mtr, left_no, LatchMode::X)?;
                        let (_, mut combined) = self.snapshot_page(mtr, lh)?;
                        combined.extend(entries.iter().cloned());
                        page::apply_min_rec_rule(&mut combined, header.level, lheader.prev.is_some());
                        if let Some(layout) = page::build_layout(payload_len, combined)? {
                            let merged_hdr = Header {
                                next: header.next,
                                ..lheader
                            };
                            self.rewrite_page(mtr, lh, &merged_hdr, &layout, RedoOp::PageRewrite)?;
                            self.refresh_twin(mtr, lh)?;
                            self.update_fill_hint(mtr, lh, &merged_hdr)?;
                            if let Some(next_no) = header.next {
                                self.relink_prev(mtr, next_no, Some(left_no))?;
                            }
                            self.observer.move_locks(page_no, left_no);
                            self.observer.drop_hash_index(page_no);
                            self.delete_node_ptr(mtr, parent, slot, anchor_key)?;
                            self.free_page(mtr, page_no, class)?;
                            self.stats.record_merge_left();
                            tracing::debug!(
                                target: "cedar::btree",
                                page = page_no.0,
                                into = left_no.0,
                                level = header.level,
                                "merged into left sibling"
                            );
                            return Ok(MergeOutcome::MergedLeft);
                        }
                        mtr.release(lh);
                    }
                    RecEntry::NodePtr { .. } => {}
                    RecEntry::Leaf { .. } => {
                        return Err(self.corrupt(mtr.page_id(parent)?, "leaf record on non-leaf page"))
                    }
                }
            }
        }

        // Right sibling: the right page survives because it keeps its own
        // subtree position; the parent's pointer for this page is redirected
        // to the survivor (its separator stays a valid lower bound) and the
        // survivor's old pointer is dropped.
        if let Some(right_no) = header.next {
            if let Some(RecEntry::NodePtr { child, .. }) = pentries.get(slot + 1) {
                if *child == right_no {
                    let (rh, rheader) = self.latch_page_checked(mtr, right_no, LatchMode::X)?;
                    let (_, rentries) = self.snapshot_page(mtr, rh)?;
                    let mut combined = entries.clone();
                    combined.extend(rentries);
                    page::apply_min_rec_rule(&mut combined, header.level, header.prev.is_some());
                    if let Some(layout) = page::build_layout(payload_len, combined)? {
                        let merged_hdr = Header {
                            prev: header.prev,
                            next: rheader.next,
                            ..rheader
                        };
                        self.rewrite_page(mtr, rh, &merged_hdr, &layout, RedoOp::PageRewrite)?;
                        self.refresh_twin(mtr, rh)?;
                        self.update_fill_hint(mtr, rh, &merged_hdr)?;
                        if let Some(prev_no) = header.prev {
                            self.relink_next(mtr, prev_no, Some(right_no))?;
                        }
                        self.observer.move_locks(page_no, right_no);
                        self.observer.drop_hash_index(page_no);
                        self.set_node_ptr_child(mtr, parent, slot, right_no)?;
                        self.delete_node_ptr(mtr, parent, slot + 1, anchor_key)?;
                        self.free_page(mtr, page_no, class)?;
                        self.stats.record_merge_right();
                        tracing::debug!(
                            target: "cedar::btree",
                            page = page_no.0,
                            into = right_no.0,
                            level = header.level,
                            "merged into right sibling"
                        );
                        return Ok(MergeOutcome::MergedRight);
                    }
                    mtr.release(rh);
                }
            }
        }

        self.stats.record_merge_decline();
        tracing::trace!(
            target: "cedar::btree",
            page = page_no.0,
            "merge declined, no sibling has room"
        );
        Ok(MergeOutcome::Declined)
    }

    /// Remove an empty page from the tree: unlink it from its siblings, drop
    /// its node pointer, and free it. `anchor_key` is the last key the page
    /// covered. A page with no siblings collapses through the root instead.
    fn discard_page(&self, mtr: &mut Mtr, h: PageHandle, anchor_key: &[u8]) -> Result<()> {
        let page_no = mtr.page_id(h)?;
        if page_no == self.root_page() {
            return Err(Error::Invalid("cannot discard the root"));
        }
        let (header, entries) = self.snapshot_page(mtr, h)?;
        if !entries.is_empty() {
            return Err(Error::Invalid("discard requires an empty page"));
        }
        if header.prev.is_none() && header.next.is_none() {
            return self.lift_sole_children(mtr);
        }
        let (parent, slot) = self.find_parent(mtr, page_no, header.level, anchor_key)?;
        if let Some(prev_no) = header.prev {
            self.relink_next(mtr, prev_no, header.next)?;
        }
        if let Some(next_no) = header.next {
            self.relink_prev(mtr, next_no, header.prev)?;
        }
        self.observer.drop_hash_index(page_no);
        self.delete_node_ptr(mtr, parent, slot, anchor_key)?;
        let class = if header.level == 0 {
            SegClass::Leaf
        } else {
            SegClass::NonLeaf
        };
        self.free_page(mtr, page_no, class)?;
        self.stats.record_discard();
        tracing::debug!(
            target: "cedar::btree",
            page = page_no.0,
            level = header.level,
            "discarded empty page"
        );
        Ok(())
    }

    /// Collapse the chain of sole children hanging off the root: while the
    /// root holds exactly one pointer, absorb its child and shrink a level.
    /// A page with no siblings is alone on its level, so every ancestor up
    /// to the root is alone too and the whole chain folds into the root.
    fn lift_sole_children(&self, mtr: &mut Mtr) -> Result<()> {
        loop {
            let root = self.root_page();
            let (rh, rheader) = self.latch_page_checked(mtr, root, LatchMode::X)?;
            if rheader.level == 0 {
                return Ok(());
            }
            let (_, root_entries) = self.snapshot_page(mtr, rh)?;
            if root_entries.len() != 1 {
                return Ok(());
            }
            let child_no = match &root_entries[0] {
                RecEntry::NodePtr { child, .. } => *child,
                RecEntry::Leaf { .. } => {
                    return Err(self.corrupt(root, "leaf record on non-leaf page"))
                }
            };
            let (ch, cheader) = self.latch_page_checked(mtr, child_no, LatchMode::X)?;
            if cheader.prev.is_some() || cheader.next.is_some() {
                return Err(self.corrupt(child_no, "sole child has siblings"));
            }
            if cheader.level + 1 != rheader.level {
                return Err(self.corrupt(child_no, "child level disagrees with parent"));
            }
            let (_, mut centries) = self.snapshot_page(mtr, ch)?;
            page::apply_min_rec_rule(&mut centries, cheader.level, false);
            let layout = page::build_layout(self.payload_len(), centries)?
                .ok_or_else(|| self.corrupt(child_no, "records overflow their own page"))?;
            let lifted_hdr = Header {
                level: cheader.level,
                prev: None,
                next: None,
                ..rheader
            };
            self.rewrite_page(mtr, rh, &lifted_hdr, &layout, RedoOp::PageLift)?;
            self.refresh_twin(mtr, rh)?;
            self.observer.move_locks(child_no, root);
            self.observer.drop_hash_index(child_no);
            let class = if cheader.level == 0 {
                SegClass::Leaf
            } else {
                SegClass::NonLeaf
            };
            self.free_page(mtr, child_no, class)?;
            self.stats.record_lift();
            tracing::debug!(
                target: "cedar::btree",
                root = root.0,
                from = child_no.0,
                level = cheader.level,
                "lifted sole child into root"
            );
        }
    }

    /// Point the left sibling link of `page_no` at `prev`.
    fn relink_prev(&self, mtr: &mut Mtr, page_no: PageId, prev: Option<PageId>) -> Result<()> {
        let (h, _) = self.latch_page_checked(mtr, page_no, LatchMode::X)?;
        {
            let frame = mtr.frame_mut(h)?;
            page::set_prev(page::payload_mut(&mut frame.buf), prev);
        }
        mtr.log(RedoOp::PageLink, page_no, &prev.map_or(0, |p| p.0).to_be_bytes());
        self.refresh_twin(mtr, h)?;
        Ok(())
    }

    /// Point the right sibling link of `page_no` at `next`.
    fn relink_next(&self, mtr: &mut Mtr, page_no: PageId, next: Option<PageId>) -> Result<()> {
        let (h, _) = self.latch_page_checked(mtr, page_no, LatchMode::X)?;
        {
            let frame = mtr.frame_mut(h)?;
            page::set_next(page::payload_mut(&mut frame.buf), next);
        }
        mtr.log(RedoOp::PageLink, page_no, &next.map_or(0, |p| p.0).to_be_bytes());
        self.refresh_twin(mtr, h)?;
        Ok(())
    }
}
