// Public operations and the shared descent machinery. Included by mod.rs.

impl BTreeIndex {
    /// Create a new index tree: allocate its root as an empty leaf and stamp
    /// both page headers. The root comes from the non-leaf segment because it
    /// stays put for the life of the tree while the leaf level churns.
    pub fn create(
        cache: Arc<dyn PageCache>,
        alloc: Arc<SegmentAllocator>,
        observer: Arc<dyn PageObserver>,
        redo: Arc<dyn RedoLog>,
        index_id: IndexId,
        options: BTreeOptions,
    ) -> Result<Self> {
        let page_size = cache.page_size();
        if page_size < outer::PAGE_HDR_LEN + page::PAYLOAD_HDR_LEN + 64 {
            return Err(Error::Invalid("page size too small for btree pages"));
        }
        if page_size - outer::PAGE_HDR_LEN > u16::MAX as usize {
            return Err(Error::Invalid("page size too large for slot offsets"));
        }
        if options.merge_threshold > 100 {
            return Err(Error::Invalid("merge threshold is a percentage"));
        }
        let index = Self {
            cache,
            alloc,
            observer,
            redo,
            latch: TreeLatch::new(),
            index_id,
            root: AtomicU64::new(0),
            page_size,
            options,
            stats: BTreeStats::default(),
        };
        let mut mtr = index.begin();
        mtr.latch_tree(&index.latch, TreeLatchMode::X);
        let root = index
            .alloc
            .alloc(SegClass::NonLeaf, None, AllocDirection::Any)?;
        let frame = index.cache.install(root)?;
        let h = mtr.latch_page(root, frame, LatchMode::X)?;
        index.init_page(&mut mtr, h, root, 0)?;
        mtr.commit()?;
        index.root.store(root.0, Ordering::Release);
        tracing::info!(
            target: "cedar::btree",
            index = index_id.0,
            root = root.0,
            "created index tree"
        );
        Ok(index)
    }

    /// Start a mini-transaction against this tree's redo sink.
    pub fn begin(&self) -> Mtr {
        Mtr::new(Arc::clone(&self.redo))
    }

    /// The root page id, 0 if the tree has been freed.
    pub fn root_page(&self) -> PageId {
        PageId(self.root.load(Ordering::Acquire))
    }

    /// This tree's identifier.
    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    /// Live structural counters.
    pub fn stats(&self) -> &BTreeStats {
        &self.stats
    }

    /// Number of levels, 1 for a tree that is a single leaf.
    pub fn height(&self) -> Result<u16> {
        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::S);
        let height = self.tree_height(&mut mtr)?;
        mtr.commit()?;
        Ok(height)
    }

    /// Look up `key`, returning its value if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut mtr = self.begin();
        let (cursor, exact) = self.search(&mut mtr, key, LatchMode::S)?;
        let out = if exact {
            let payload = page::payload(mtr.page_bytes(cursor.page)?);
            let header = Header::parse(payload)?;
            let extents = SlotExtents::parse(payload, &header)?;
            let ext = extents.get(cursor.slot)?;
            Some(page::decode_leaf_record(page::record(payload, &ext))?.value.to_vec())
        } else {
            None
        };
        mtr.commit()?;
        Ok(out)
    }

    /// Insert `key` with `value`, replacing the value if the key exists.
    ///
    /// The optimistic attempt runs under the tree S latch with only the leaf
    /// X-latched; when the record does not fit even after a rebuild, the
    /// operation restarts under SX with the whole path latched and splits.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Invalid("empty key"));
        }
        let entry = RecEntry::Leaf {
            info: 0,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let payload_len = self.payload_len();
        if entry.encoded_len() + page::SLOT_ENTRY_LEN > payload_len - page::PAYLOAD_HDR_LEN {
            return Err(Error::Invalid("record larger than page capacity"));
        }
        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::S);
        let (cursor, exact) = self.search(&mut mtr, key, LatchMode::X)?;
        if self.try_insert_in_page(&mut mtr, cursor, exact, &entry)? {
            mtr.commit()?;
            return Ok(());
        }
        drop(mtr);

        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::Sx);
        let height = self.tree_height(&mut mtr)?;
        self.alloc.reserve(u64::from(height) + 2)?;
        let (cursor, exact) = self.search(&mut mtr, key, LatchMode::X)?;
        if self.try_insert_in_page(&mut mtr, cursor, exact, &entry)? {
            mtr.commit()?;
            return Ok(());
        }
        self.insert_pessimistic(&mut mtr, cursor, exact, entry)?;
        mtr.commit()?;
        Ok(())
    }

    /// Delete `key`, returning whether it was present. A page left empty or
    /// under the merge threshold is shrunk in a follow-up pass under SX.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::S);
        let (cursor, exact) = self.search(&mut mtr, key, LatchMode::X)?;
        if !exact {
            mtr.commit()?;
            return Ok(false);
        }
        let page_no = mtr.page_id(cursor.page)?;
        let (header, mut entries) = self.snapshot_page(&mtr, cursor.page)?;
        entries.remove(cursor.slot);
        let payload_len = self.payload_len();
        let layout = page::build_layout(payload_len, entries)?
            .ok_or_else(|| self.corrupt(page_no, "records overflow their own page"))?;
        let occupied = layout.data_size();
        let empty = layout.entries().is_empty();
        self.rewrite_page(&mut mtr, cursor.page, &header, &layout, RedoOp::RecordDelete)?;
        self.refresh_twin(&mut mtr, cursor.page)?;
        self.update_fill_hint(&mtr, cursor.page, &header)?;
        let underfull = page::fill_pct(payload_len, occupied) < self.options.merge_threshold;
        let is_root = page_no == self.root_page();
        mtr.commit()?;
        if !is_root && (empty || underfull) {
            self.shrink_after_delete(key)?;
        }
        Ok(true)
    }

    /// Position a cursor on the leaf covering `key`. The leaf is latched with
    /// `mode`; the tree S latch is taken if the mtr holds none. Returns the
    /// cursor and whether the key was found exactly; on a miss the cursor
    /// slot is the insertion point.
    pub fn search(&self, mtr: &mut Mtr, key: &[u8], mode: LatchMode) -> Result<(Cursor, bool)> {
        if mtr.tree_latch_mode().is_none() {
            mtr.latch_tree(&self.latch, TreeLatchMode::S);
        }
        self.stats.record_search();
        let latch_path = mode == LatchMode::X
            && matches!(
                mtr.tree_latch_mode(),
                Some(TreeLatchMode::Sx | TreeLatchMode::X)
            );
        let (h, header) = self.descend_to_level(mtr, key, 0, mode, latch_path)?;
        let page_no = mtr.page_id(h)?;
        let payload = page::payload(mtr.page_bytes(h)?);
        let extents = SlotExtents::parse(payload, &header)
            .map_err(|_| self.corrupt(page_no, "slot directory undecodable"))?;
        match cursor::leaf_lower_bound(payload, &header, &extents, key)? {
            Ok(slot) => Ok((Cursor { page: h, slot }, true)),
            Err(slot) => Ok((Cursor { page: h, slot }, false)),
        }
    }

    /// Rebuild an X-latched page in place: pack records densely, clear the
    /// last-insert marker, and reapply the min-rec rule.
    pub fn reorganize(&self, mtr: &mut Mtr, h: PageHandle) -> Result<()> {
        if !mtr.is_x_latched(h) {
            return Err(Error::Invalid("reorganize requires an exclusive page latch"));
        }
        let page_no = mtr.page_id(h)?;
        let (header, mut entries) = self.snapshot_page(mtr, h)?;
        page::apply_min_rec_rule(&mut entries, header.level, header.prev.is_some());
        let layout = page::build_layout(self.payload_len(), entries)?
            .ok_or_else(|| self.corrupt(page_no, "records overflow their own page"))?;
        self.rewrite_page(mtr, h, &header, &layout, RedoOp::PageRewrite)?;
        self.refresh_twin(mtr, h)?;
        self.stats.record_reorganize();
        Ok(())
    }

    /// Try to merge or lift the leaf covering `key`, regardless of its fill.
    pub fn compress(&self, key: &[u8]) -> Result<MergeOutcome> {
        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::Sx);
        let (cursor, _) = self.search(&mut mtr, key, LatchMode::X)?;
        let outcome = self.try_compress(&mut mtr, cursor.page, key)?;
        mtr.commit()?;
        Ok(outcome)
    }

    /// Free every page of the tree, leaves first and the root last. The root
    /// id is zeroed; the tree cannot be used afterwards.
    pub fn free_tree(&self) -> Result<()> {
        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::X);
        let root = self.root_page();
        if root.0 == 0 {
            mtr.commit()?;
            return Ok(());
        }
        let sp = mtr.savepoint();
        let (_, rheader) = self.latch_page_checked(&mut mtr, root, LatchMode::S)?;
        let root_level = rheader.level;
        mtr.release_to(sp);
        let mut doomed: Vec<(PageId, u16)> = Vec::new();
        for level in (0..=root_level).rev() {
            let mut cur = Some(self.leftmost_at_level(&mut mtr, level)?);
            while let Some(page_no) = cur {
                let sp = mtr.savepoint();
                let (_, header) = self.latch_page_checked(&mut mtr, page_no, LatchMode::S)?;
                cur = header.next;
                mtr.release_to(sp);
                if page_no != root {
                    doomed.push((page_no, level));
                }
            }
        }
        // Leaves were collected last; free them first so node pointers never
        // dangle into freed space mid-operation.
        for &(page_no, level) in doomed.iter().rev() {
            let class = if level == 0 {
                SegClass::Leaf
            } else {
                SegClass::NonLeaf
            };
            self.free_page(&mut mtr, page_no, class)?;
        }
        self.free_page(&mut mtr, root, SegClass::NonLeaf)?;
        self.root.store(0, Ordering::Release);
        mtr.commit()?;
        tracing::info!(
            target: "cedar::btree",
            index = self.index_id.0,
            pages = doomed.len() + 1,
            "freed index tree"
        );
        Ok(())
    }

    // Internal helpers shared across the engine.

    fn payload_len(&self) -> usize {
        self.page_size - outer::PAGE_HDR_LEN
    }

    fn corrupt(&self, page: PageId, detail: &'static str) -> Error {
        let space = self.alloc.space();
        tracing::error!(
            target: "cedar::btree",
            space = space.0,
            index = self.index_id.0,
            page = page.0,
            detail,
            "corruption detected"
        );
        Error::CorruptPage {
            space,
            index: self.index_id,
            page,
            detail,
        }
    }

    /// Stamp both headers of a fresh page.
    fn init_page(&self, mtr: &mut Mtr, h: PageHandle, page_no: PageId, level: u16) -> Result<()> {
        let header = outer::PageHeader::new(
            page_no,
            outer::PageKind::BTree,
            self.page_size as u32,
            self.alloc.space(),
        )?;
        let index_id = self.index_id;
        {
            let frame = mtr.frame_mut(h)?;
            header.encode(&mut frame.buf)?;
            page::write_initial_header(page::payload_mut(&mut frame.buf), level, index_id)?;
        }
        mtr.log(RedoOp::PageInit, page_no, &level.to_be_bytes());
        Ok(())
    }

    /// Latch a page and cross-check both headers before trusting a byte.
    fn latch_page_checked(
        &self,
        mtr: &mut Mtr,
        page_no: PageId,
        mode: LatchMode,
    ) -> Result<(PageHandle, Header)> {
        let frame = self.cache.frame(page_no)?;
        let h = mtr.latch_page(page_no, frame, mode)?;
        let header = self.parse_checked(mtr, h, page_no)?;
        Ok((h, header))
    }

    fn parse_checked(&self, mtr: &Mtr, h: PageHandle, page_no: PageId) -> Result<Header> {
        let buf = mtr.page_bytes(h)?;
        let outer_hdr = outer::PageHeader::decode(buf)
            .map_err(|_| self.corrupt(page_no, "outer header undecodable"))?;
        if outer_hdr.kind != outer::PageKind::BTree {
            return Err(self.corrupt(page_no, "page is not a live btree page"));
        }
        if outer_hdr.page_no != page_no {
            return Err(self.corrupt(page_no, "page number mismatch"));
        }
        if outer_hdr.space != self.alloc.space() {
            return Err(self.corrupt(page_no, "page belongs to another space"));
        }
        let header = Header::parse(page::payload(buf))
            .map_err(|_| self.corrupt(page_no, "payload header undecodable"))?;
        if header.index_id != self.index_id {
            return Err(self.corrupt(page_no, "page belongs to another index"));
        }
        Ok(header)
    }

    /// Descend from the root to the page covering `key` at `target_level`.
    ///
    /// With `latch_path` every visited page is X-latched and kept in the
    /// memo (the pessimistic protocol). Otherwise ancestors are S-latched
    /// hand over hand and released once the child is held, and only the
    /// target keeps `mode`; a page freed or raised in the latch gap is
    /// detected by header checks and the descent restarts from the root.
    fn descend_to_level(
        &self,
        mtr: &mut Mtr,
        key: &[u8],
        target_level: u16,
        mode: LatchMode,
        latch_path: bool,
    ) -> Result<(PageHandle, Header)> {
        'restart: loop {
            let root = self.root_page();
            if root.0 == 0 {
                return Err(Error::Invalid("index tree is not created"));
            }
            let mut page_no = root;
            let mut expected: Option<u16> = None;
            let mut parent: Option<PageHandle> = None;
            loop {
                let want = if latch_path {
                    LatchMode::X
                } else if expected == Some(target_level) {
                    mode
                } else {
                    LatchMode::S
                };
                let (h, header) = self.latch_page_checked(mtr, page_no, want)?;
                if let Some(level) = expected {
                    if header.level != level {
                        return Err(self.corrupt(page_no, "child level disagrees with parent"));
                    }
                } else if header.level < target_level {
                    return Err(Error::Invalid("target level above the root"));
                }
                // The root turned out to be the target but was probed with S;
                // retake it exclusively. A raise in the gap moves the records
                // down while keeping the root id, so a level change just
                // restarts the descent.
                if !latch_path
                    && expected.is_none()
                    && header.level == target_level
                    && mode == LatchMode::X
                    && want != LatchMode::X
                {
                    mtr.release(h);
                    let (h2, header2) = self.latch_page_checked(mtr, page_no, LatchMode::X)?;
                    if header2.level != target_level {
                        mtr.release(h2);
                        continue 'restart;
                    }
                    return Ok((h2, header2));
                }
                if header.level == target_level {
                    if !latch_path {
                        if let Some(p) = parent {
                            mtr.release(p);
                        }
                    }
                    return Ok((h, header));
                }
                let child = {
                    let payload = page::payload(mtr.page_bytes(h)?);
                    let extents = SlotExtents::parse(payload, &header)
                        .map_err(|_| self.corrupt(page_no, "slot directory undecodable"))?;
                    if extents.is_empty() {
                        return Err(self.corrupt(page_no, "non-leaf page without pointers"));
                    }
                    let slot = cursor::descend_slot(payload, &header, &extents, key)?;
                    let ext = extents.get(slot)?;
                    page::decode_node_ptr(page::record(payload, &ext))
                        .map_err(|_| self.corrupt(page_no, "node pointer undecodable"))?
                        .child
                };
                if !latch_path {
                    if let Some(p) = parent {
                        mtr.release(p);
                    }
                    parent = Some(h);
                }
                expected = Some(header.level - 1);
                page_no = child;
            }
        }
    }

    /// Root level + 1, read under a transient S latch.
    fn tree_height(&self, mtr: &mut Mtr) -> Result<u16> {
        let sp = mtr.savepoint();
        let (_, header) = self.latch_page_checked(mtr, self.root_page(), LatchMode::S)?;
        mtr.release_to(sp);
        Ok(header.level + 1)
    }

    /// Decode a latched page into owned entries.
    fn snapshot_page(&self, mtr: &Mtr, h: PageHandle) -> Result<(Header, Vec<RecEntry>)> {
        let page_no = mtr.page_id(h)?;
        page::snapshot(page::payload(mtr.page_bytes(h)?))
            .map_err(|_| self.corrupt(page_no, "page records undecodable"))
    }

    /// Rebuild a page's payload from `layout`, taking its identity (level
    /// and sibling links) from `header`.
    fn rewrite_page(
        &self,
        mtr: &mut Mtr,
        h: PageHandle,
        header: &Header,
        layout: &page::Layout,
        op: RedoOp,
    ) -> Result<()> {
        let page_no = mtr.page_id(h)?;
        let index_id = self.index_id;
        {
            let frame = mtr.frame_mut(h)?;
            page::apply_layout(
                page::payload_mut(&mut frame.buf),
                header.level,
                index_id,
                header.prev,
                header.next,
                layout,
            )?;
        }
        mtr.log(op, page_no, &[]);
        Ok(())
    }

    /// Recompress the page into its twin; on overflow the twin is dropped
    /// and the page continues uncompressed.
    fn refresh_twin(&self, mtr: &mut Mtr, h: PageHandle) -> Result<()> {
        let Some(budget) = self.options.zip_budget else {
            return Ok(());
        };
        let page_no = mtr.page_id(h)?;
        let frame = mtr.frame_mut(h)?;
        if !zip::refresh(frame, budget)? {
            self.stats.record_zip_fallback();
            tracing::debug!(
                target: "cedar::btree",
                page = page_no.0,
                budget,
                "compressed twin dropped"
            );
        }
        Ok(())
    }

    /// Publish a leaf's fill percentage to the allocator.
    fn update_fill_hint(&self, mtr: &Mtr, h: PageHandle, header: &Header) -> Result<()> {
        if header.level != 0 {
            return Ok(());
        }
        let page_no = mtr.page_id(h)?;
        let payload = page::payload(mtr.page_bytes(h)?);
        let fresh = Header::parse(payload)?;
        let extents = SlotExtents::parse(payload, &fresh)?;
        self.alloc
            .set_free_space_hint(page_no, page::fill_pct(payload.len(), extents.data_size()));
        Ok(())
    }

    /// Optimistic record placement: rebuild the leaf with the entry included
    /// when it fits, recording the insert slot for the split heuristic.
    fn try_insert_in_page(
        &self,
        mtr: &mut Mtr,
        cursor: Cursor,
        exact: bool,
        entry: &RecEntry,
    ) -> Result<bool> {
        let (header, mut entries) = self.snapshot_page(mtr, cursor.page)?;
        if exact {
            entries[cursor.slot] = entry.clone();
        } else {
            entries.insert(cursor.slot, entry.clone());
        }
        let Some(layout) = page::build_layout(self.payload_len(), entries)? else {
            return Ok(false);
        };
        self.rewrite_page(mtr, cursor.page, &header, &layout, RedoOp::RecordInsert)?;
        {
            let frame = mtr.frame_mut(cursor.page)?;
            page::set_last_insert(page::payload_mut(&mut frame.buf), Some(cursor.slot));
        }
        self.refresh_twin(mtr, cursor.page)?;
        self.update_fill_hint(mtr, cursor.page, &header)?;
        Ok(true)
    }

    /// Re-descend under SX and merge, discard, or lift the leaf that covered
    /// `key` if it is still empty or underfull.
    fn shrink_after_delete(&self, key: &[u8]) -> Result<()> {
        let mut mtr = self.begin();
        mtr.latch_tree(&self.latch, TreeLatchMode::Sx);
        let (cursor, _) = self.search(&mut mtr, key, LatchMode::X)?;
        let page_no = mtr.page_id(cursor.page)?;
        if page_no == self.root_page() {
            mtr.commit()?;
            return Ok(());
        }
        let (_, entries) = self.snapshot_page(&mtr, cursor.page)?;
        if entries.is_empty() {
            self.discard_page(&mut mtr, cursor.page, key)?;
        } else {
            let occupied: usize = entries
                .iter()
                .map(|e| e.encoded_len() + page::SLOT_ENTRY_LEN)
                .sum();
            if page::fill_pct(self.payload_len(), occupied) < self.options.merge_threshold {
                let _ = self.try_compress(&mut mtr, cursor.page, key)?;
            }
        }
        mtr.commit()?;
        Ok(())
    }

    /// First page of `level`, reached by following slot-0 pointers.
    fn leftmost_at_level(&self, mtr: &mut Mtr, target: u16) -> Result<PageId> {
        let mut page_no = self.root_page();
        loop {
            let sp = mtr.savepoint();
            let (h, header) = self.latch_page_checked(mtr, page_no, LatchMode::S)?;
            if header.level == target {
                mtr.release_to(sp);
                return Ok(page_no);
            }
            if header.level < target {
                return Err(self.corrupt(page_no, "level missing from tree"));
            }
            let child = {
                let payload = page::payload(mtr.page_bytes(h)?);
                let extents = SlotExtents::parse(payload, &header)
                    .map_err(|_| self.corrupt(page_no, "slot directory undecodable"))?;
                if extents.is_empty() {
                    return Err(self.corrupt(page_no, "non-leaf page without pointers"));
                }
                let ext = extents.get(0)?;
                page::decode_node_ptr(page::record(payload, &ext))
                    .map_err(|_| self.corrupt(page_no, "node pointer undecodable"))?
                    .child
            };
            mtr.release_to(sp);
            page_no = child;
        }
    }

    /// Stamp a page free, return it to its segment, and evict its frame.
    fn free_page(&self, mtr: &mut Mtr, page_no: PageId, class: SegClass) -> Result<()> {
        let frame = self.cache.frame(page_no)?;
        let h = mtr.latch_page(page_no, frame, LatchMode::X)?;
        {
            let f = mtr.frame_mut(h)?;
            outer::set_kind(&mut f.buf, outer::PageKind::Free)?;
            outer::refresh_crc32(&mut f.buf)?;
            f.zip = None;
        }
        mtr.log(RedoOp::PageFree, page_no, &[]);
        self.alloc.free(class, page_no);
        mtr.release(h);
        self.cache.evict(page_no);
        Ok(())
    }
}
