//! Per-worker placement of remapped mid objects.

use crate::collector::population::RemapTargetArray;
use crate::policy::space::HeapContext;
use crate::util::heap::layout::PageNum;
use crate::util::heap::page_info::Gen;
use crate::util::Address;
use enum_map::EnumMap;

/// The open target block of one GC worker for each generation it remaps into. Blocks are
/// uncommitted: objects bring their pages along when the batch commits. Every block handed out is
/// recorded in the collector's target array so it can be healed after relocation.
pub struct RemapBuffers {
    blocks: EnumMap<Gen, PageNum>,
}

impl Default for RemapBuffers {
    fn default() -> Self {
        RemapBuffers {
            blocks: EnumMap::from_fn(|_| PageNum::NONE),
        }
    }
}

impl RemapBuffers {
    /// Place `words` words remapped from `source` into `target`. `words` is already aligned.
    pub fn allocate(
        &mut self,
        heap: &HeapContext,
        targets: &RemapTargetArray,
        source: Gen,
        target: Gen,
        words: usize,
        time: i64,
    ) -> Address {
        let meta = heap.meta();
        let block = self.blocks[target];
        if block.is_some() {
            let info = meta.info(block);
            debug_assert_eq!(info.relocate_space(), Some(source));
            let top = info.top();
            let end = meta.page_to_addr(block).plus_words(meta.layout.words_in_mid_block());
            if top.plus_words(words) <= end {
                info.set_top(top.plus_words(words));
                return top;
            }
        }
        let block = heap.generation(target).allocate_mid_remapping_page(source);
        let info = meta.info(block);
        info.set_time(time);
        let start = meta.page_to_addr(block);
        info.set_top(start.plus_words(words));
        targets.add_page(block, time, source);
        self.blocks[target] = block;
        trace!("Remapping {} objects into {} block {}", source, target, block);
        start
    }

    /// Forget the open blocks. They stay in the target array.
    pub fn close_all(&mut self) {
        self.blocks = EnumMap::from_fn(|_| PageNum::NONE);
    }
}
