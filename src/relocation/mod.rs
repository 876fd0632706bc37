//! Moving live objects out of sparse pages.
//!
//! Every page selected for relocation gets a forwarding table carved from the [`sideband`] arena, with
//! one [`object_relocation::ObjectRelocation`] record per live object. Small-space objects are copied
//! one at a time by whichever thread claims them first, GC worker or mutator; the GC side allocates
//! through a [`reloc_buffer::RelocBuffers`]. Mid-space objects are moved by remapping their memory
//! into target blocks handed out by a [`remap_buffer::RemapBuffers`], which are healed later.
//! [`page_relocation`] drives both for whole pages.

pub mod object_relocation;
pub mod page_relocation;
pub mod reloc_buffer;
pub mod remap_buffer;
pub mod sideband;
