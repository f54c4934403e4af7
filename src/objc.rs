//! Async-safe Objective-C metadata parsing.
//!
//! Extracts class and method information straight out of a crashed
//! process's loaded images, for symbolicating instruction pointers that
//! land inside Objective-C methods. Two metadata generations are handled:
//! the legacy ObjC1 `__OBJC/__module_info` tables and the modern ObjC2
//! `__DATA/__objc_classlist` layout, each in 32- and 64-bit flavors.
//!
//! Everything is read through memory objects and bounded task reads; the
//! only allocation is the class data cache, which is grabbed with a single
//! `mmap` on first use and simply disabled if that fails.

use core::ptr;

use zerocopy::{AsBytes, FromBytes};

use crate::debug_log::debug_log;
use crate::error::Error;
use crate::macho::{MachImage, SEG_DATA};
use crate::mobject::{MemoryObject, ReadStruct};
use crate::task::TaskMemory;
use crate::unaligned::{U16, U32, U64};

const SEG_OBJC: &str = "__OBJC";
const SECT_MODULE_INFO: &str = "__module_info";
const SECT_CLASSLIST: &str = "__objc_classlist";
const SECT_OBJC_CONST: &str = "__objc_const";
const SECT_OBJC_DATA: &str = "__objc_data";

/// ObjC1 class info bit: the method-list field points at a single list
/// rather than a NUL-terminated array of list pointers.
const CLS_NO_METHOD_ARRAY: u32 = 0x4000;
/// ObjC1 method-list array terminator (the runtime checks NULL and -1).
const END_OF_METHODS_LIST: u32 = u32::MAX;

/// The class's rw data has been realized by the runtime.
const RW_REALIZED: u32 = 1 << 31;
/// The realized class's ro pointer is a heap copy, not `__objc_const` data.
const RW_COPIED_RO: u32 = 1 << 27;

/// Upper bound on methods read from one list; garbage counts stop here.
const MAX_METHODS: u32 = 0x10000;

const CLASS_NAME_MAX: usize = 128;
const METHOD_NAME_MAX: usize = 256;

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc1Module {
    version: U32,
    size: U32,
    name: U32,
    symtab: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc1Symtab {
    sel_ref_cnt: U32,
    refs: U32,
    cls_def_count: U16,
    cat_def_count: U16,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc1Class {
    isa: U32,
    superclass: U32,
    name: U32,
    version: U32,
    info: U32,
    instance_size: U32,
    ivars: U32,
    methods: U32,
    cache: U32,
    protocols: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc1MethodList {
    obsolete: U32,
    count: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc1Method {
    name: U32,
    types: U32,
    imp: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2Class32 {
    isa: U32,
    superclass: U32,
    cache: U32,
    vtable: U32,
    data_rw: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2Class64 {
    isa: U64,
    superclass: U64,
    cache: U64,
    vtable: U64,
    data_rw: U64,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2ClassDataRw32 {
    flags: U32,
    version: U32,
    data_ro: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2ClassDataRw64 {
    flags: U32,
    version: U32,
    data_ro: U64,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2ClassDataRo32 {
    flags: U32,
    instance_start: U32,
    instance_size: U32,
    ivar_layout: U32,
    name: U32,
    base_methods: U32,
    base_protocols: U32,
    ivars: U32,
    weak_ivar_layout: U32,
    base_properties: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2ClassDataRo64 {
    flags: U32,
    instance_start: U32,
    instance_size: U32,
    reserved: U32,
    ivar_layout: U64,
    name: U64,
    base_methods: U64,
    base_protocols: U64,
    ivars: U64,
    weak_ivar_layout: U64,
    base_properties: U64,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2Method32 {
    name: U32,
    types: U32,
    imp: U32,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2Method64 {
    name: U64,
    types: U64,
    imp: U64,
}

#[derive(FromBytes, AsBytes, Clone, Copy)]
#[repr(C)]
struct Objc2ListHeader {
    entsize: U32,
    count: U32,
}

/// Read a `#[repr(C)]` structure at an arbitrary task address.
fn read_task_struct<S: FromBytes + AsBytes, T: TaskMemory + ?Sized>(
    task: &T,
    addr: u64,
) -> Result<S, Error> {
    let mut value = S::new_zeroed();
    task.read_bytes(addr, value.as_bytes_mut())?;
    Ok(value)
}

/// The method-found callback: `(is_class_method, class_name, method_name,
/// imp)`.
pub type MethodCallback<'a> = dyn FnMut(bool, &str, &str, u64) + 'a;

/// Fixed-capacity memoization of class data_rw -> data_ro resolutions.
///
/// Single-probe open addressing: the probe index is `(key >> 2) % capacity`
/// and an occupied slot is never displaced, so a probe costs exactly one
/// comparison and a collision is a miss. The backing pages come from one
/// `mmap` on first insertion; if that fails the cache stays disabled and
/// parsing just runs slower.
struct ClassDataCache {
    keys: *mut u64,
    capacity: usize,
}

const CLASS_CACHE_CAPACITY: usize = 1024;

impl ClassDataCache {
    fn new() -> Self {
        ClassDataCache {
            keys: ptr::null_mut(),
            capacity: 0,
        }
    }

    fn index(&self, key: u64) -> usize {
        ((key >> 2) % self.capacity as u64) as usize
    }

    fn lookup(&self, key: u64) -> Option<u64> {
        if self.capacity == 0 {
            return None;
        }
        let index = self.index(key);
        unsafe {
            if *self.keys.add(index) == key {
                Some(*self.keys.add(self.capacity + index))
            } else {
                None
            }
        }
    }

    fn insert(&mut self, key: u64, value: u64) {
        if self.capacity == 0 {
            let bytes = CLASS_CACHE_CAPACITY * 2 * core::mem::size_of::<u64>();
            let map = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if map == libc::MAP_FAILED {
                debug_log!("class cache allocation failed; parsing uncached");
                return;
            }
            self.keys = map as *mut u64;
            self.capacity = CLASS_CACHE_CAPACITY;
        }
        let index = self.index(key);
        unsafe {
            // First writer wins; a key of zero marks an empty slot.
            if *self.keys.add(index) == 0 {
                *self.keys.add(index) = key;
                *self.keys.add(self.capacity + index) = value;
            }
        }
    }
}

impl Drop for ClassDataCache {
    fn drop(&mut self) {
        if self.capacity != 0 {
            unsafe {
                libc::munmap(
                    self.keys as *mut libc::c_void,
                    self.capacity * 2 * core::mem::size_of::<u64>(),
                );
            }
        }
    }
}

/// Per-session ObjC parse state: mapped metadata sections for the image
/// most recently parsed, plus the class data cache.
pub struct ObjCContext {
    /// Set once ObjC2 data has been found; ObjC1 probing stops then.
    got_objc2_info: bool,
    last_image_base: Option<u64>,
    objc_const: Option<MemoryObject>,
    class_list: Option<MemoryObject>,
    objc_data: Option<MemoryObject>,
    class_cache: ClassDataCache,
}

impl ObjCContext {
    pub fn new() -> Self {
        ObjCContext {
            got_objc2_info: false,
            last_image_base: None,
            objc_const: None,
            class_list: None,
            objc_data: None,
            class_cache: ClassDataCache::new(),
        }
    }

    fn free_mapped_sections(&mut self) {
        self.objc_const = None;
        self.class_list = None;
        self.objc_data = None;
    }

    /// Map the three ObjC2 metadata sections for `image`, reusing the
    /// mappings when the image is unchanged since the previous call.
    fn map_sections<T: TaskMemory + ?Sized>(
        &mut self,
        task: &T,
        image: &MachImage,
    ) -> Result<(), Error> {
        if self.last_image_base == Some(image.base()) {
            return Ok(());
        }
        // The stale image pointer is dropped first so an early error below
        // cannot leave mappings attributed to the wrong image.
        self.free_mapped_sections();
        self.last_image_base = None;

        self.objc_const = Some(image.map_section(task, SEG_DATA, SECT_OBJC_CONST)?);
        self.class_list = Some(image.map_section(task, SEG_DATA, SECT_CLASSLIST)?);
        self.objc_data = Some(image.map_section(task, SEG_DATA, SECT_OBJC_DATA)?);
        self.last_image_base = Some(image.base());
        Ok(())
    }
}

impl Default for ObjCContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse Objective-C class data from `image`, invoking `callback` for every
/// instance and class method found. Tries ObjC1 data first (unless ObjC2
/// data was already seen in this session), then ObjC2.
pub fn parse<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    context: &mut ObjCContext,
    callback: &mut MethodCallback<'_>,
) -> Result<(), Error> {
    let objc1 = if context.got_objc2_info {
        // ObjC1 data was absent before; don't probe for it again.
        Err(Error::NotFound)
    } else {
        parse_objc1(task, image, callback)
    };
    match objc1 {
        Err(Error::NotFound) => {
            parse_objc2(task, image, context, callback)?;
            context.got_objc2_info = true;
            Ok(())
        }
        other => other,
    }
}

/// Search `image` for the method whose implementation covers `imp` and
/// invoke `callback` with its identity.
///
/// Two full parse passes: the first computes the greatest method address
/// at or below `imp`, the second emits the match. Splitting the search this
/// way avoids accumulating candidates in memory.
pub fn find_method<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    context: &mut ObjCContext,
    imp: u64,
    callback: &mut MethodCallback<'_>,
) -> Result<(), Error> {
    let mut best_imp: u64 = 0;
    parse(task, image, context, &mut |_, _, _, method_imp| {
        if method_imp >= best_imp && method_imp <= imp {
            best_imp = method_imp;
        }
    })?;
    if best_imp == 0 {
        return Err(Error::NotFound);
    }

    let mut fired = false;
    parse(task, image, context, &mut |is_class_method, class_name, method_name, method_imp| {
        if method_imp == best_imp && !fired {
            fired = true;
            callback(is_class_method, class_name, method_name, method_imp);
        }
    })
}

/// Legacy ObjC1: walk `__OBJC/__module_info` module records to their
/// symtabs and class definitions. Returns `NotFound` if the image has no
/// such section.
fn parse_objc1<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    callback: &mut MethodCallback<'_>,
) -> Result<(), Error> {
    let bo = image.byte_order();
    let module_mobj = image.map_section(task, SEG_OBJC, SECT_MODULE_INFO)?;
    let module_size = core::mem::size_of::<Objc1Module>() as u64;
    let module_count = module_mobj.len() / module_size;

    for module_index in 0..module_count {
        let module: &Objc1Module = module_mobj
            .bytes()
            .read_at(module_index * module_size)
            .ok_or(Error::InvalidData)?;
        let symtab_addr = module.symtab.get(bo) as u64;
        if symtab_addr == 0 {
            continue;
        }
        let symtab: Objc1Symtab = read_task_struct(task, symtab_addr)?;

        // Class definition pointers sit directly after the symtab struct;
        // an equal number of category definitions follows them, untouched
        // here.
        let class_count = symtab.cls_def_count.get(bo);
        for i in 0..class_count as u64 {
            let cursor = symtab_addr + core::mem::size_of::<Objc1Symtab>() as u64 + i * 4;
            let class_addr = task.read_u32(cursor, bo)? as u64;
            let class: Objc1Class = read_task_struct(task, class_addr)?;
            parse_objc1_class(task, image, &class, false, callback)?;

            let metaclass_addr = class.isa.get(bo) as u64;
            let metaclass: Objc1Class = read_task_struct(task, metaclass_addr)?;
            parse_objc1_class(task, image, &metaclass, true, callback)?;
        }
    }
    Ok(())
}

fn parse_objc1_class<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    class: &Objc1Class,
    is_meta_class: bool,
    callback: &mut MethodCallback<'_>,
) -> Result<(), Error> {
    let bo = image.byte_order();
    let mut class_name_buf = [0u8; CLASS_NAME_MAX];
    let class_name = task.read_cstr(class.name.get(bo) as u64, &mut class_name_buf)?;

    // The methods field is either one method_list or a NUL/-1 terminated
    // array of method_list pointers, depending on the info bit.
    let has_multiple_lists = class.info.get(bo) & CLS_NO_METHOD_ARRAY == 0;
    let mut list_cursor = class.methods.get(bo) as u64;

    loop {
        let list_addr = if has_multiple_lists {
            let ptr = task.read_u32(list_cursor, bo)?;
            if ptr == 0 || ptr == END_OF_METHODS_LIST {
                break;
            }
            list_cursor += 4;
            ptr as u64
        } else {
            if list_cursor == 0 {
                break;
            }
            list_cursor
        };

        let list: Objc1MethodList = read_task_struct(task, list_addr)?;
        let count = list.count.get(bo).min(MAX_METHODS);
        for i in 0..count as u64 {
            let method_addr = list_addr
                + core::mem::size_of::<Objc1MethodList>() as u64
                + i * core::mem::size_of::<Objc1Method>() as u64;
            let method: Objc1Method = read_task_struct(task, method_addr)?;

            let mut method_name_buf = [0u8; METHOD_NAME_MAX];
            let method_name = task.read_cstr(method.name.get(bo) as u64, &mut method_name_buf)?;
            callback(
                is_meta_class,
                class_name,
                method_name,
                method.imp.get(bo) as u64,
            );
        }

        if !has_multiple_lists {
            break;
        }
    }
    Ok(())
}

/// Modern ObjC2: walk the `__objc_classlist` pointer array. Returns
/// `NotFound` if the image carries no ObjC2 metadata.
fn parse_objc2<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    context: &mut ObjCContext,
    callback: &mut MethodCallback<'_>,
) -> Result<(), Error> {
    let is_64 = image.is_64();
    let ptr_size = image.pointer_width();
    context.map_sections(task, image)?;

    let (list_addr, list_len) = {
        let class_list = context.class_list.as_ref().ok_or(Error::Internal)?;
        (class_list.task_address(), class_list.len())
    };
    let class_count = list_len / ptr_size;

    for i in 0..class_count {
        let entry_addr = list_addr + i * ptr_size;
        let class_addr = {
            let class_list = context.class_list.as_ref().ok_or(Error::Internal)?;
            let entry = class_list
                .remap(entry_addr, 0, ptr_size)
                .ok_or(Error::InvalidData)?;
            read_uword_bytes(entry, is_64, image)
        };

        let (isa, data_rw) = read_objc2_class(task, context, image, class_addr)?;
        parse_objc2_class(task, image, context, data_rw, false, callback)?;

        // The metaclass carries the class methods.
        let (_, meta_data_rw) = read_objc2_class(task, context, image, isa)?;
        parse_objc2_class(task, image, context, meta_data_rw, true, callback)?;
    }
    Ok(())
}

fn read_uword_bytes(bytes: &[u8], is_64: bool, image: &MachImage) -> u64 {
    let bo = image.byte_order();
    if is_64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        U64(buf).get(bo)
    } else {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        U32(buf).get(bo) as u64
    }
}

/// Read a class structure, preferring the mapped `__objc_data` section and
/// falling back to a direct task read for classes living elsewhere.
fn read_objc2_class<T: TaskMemory + ?Sized>(
    task: &T,
    context: &ObjCContext,
    image: &MachImage,
    class_addr: u64,
) -> Result<(u64, u64), Error> {
    let bo = image.byte_order();
    if image.is_64() {
        let class: Objc2Class64 = match context
            .objc_data
            .as_ref()
            .and_then(|m| m.remap_struct::<Objc2Class64>(class_addr, 0))
        {
            Some(class) => *class,
            None => read_task_struct(task, class_addr)?,
        };
        Ok((class.isa.get(bo), class.data_rw.get(bo)))
    } else {
        let class: Objc2Class32 = match context
            .objc_data
            .as_ref()
            .and_then(|m| m.remap_struct::<Objc2Class32>(class_addr, 0))
        {
            Some(class) => *class,
            None => read_task_struct(task, class_addr)?,
        };
        Ok((class.isa.get(bo) as u64, class.data_rw.get(bo) as u64))
    }
}

/// Resolved read-only class data, width-erased.
struct ClassRo {
    name: u64,
    base_methods: u64,
}

fn parse_objc2_class<T: TaskMemory + ?Sized>(
    task: &T,
    image: &MachImage,
    context: &mut ObjCContext,
    data_rw_ptr: u64,
    is_meta_class: bool,
    callback: &mut MethodCallback<'_>,
) -> Result<(), Error> {
    let bo = image.byte_order();
    let is_64 = image.is_64();
    // The low bits of the data pointer carry flags.
    let data_ptr = data_rw_ptr & !3u64;
    if data_ptr == 0 {
        return Ok(());
    }

    // Resolve data_rw -> data_ro, memoized: the resolution never changes
    // for a realized class, so a cached address is either still correct or
    // detectably unreadable. The cache does not record whether the ro data
    // was a heap copy, so cache hits probe the section mapping first and
    // fall back to a direct read.
    let (data_ro_addr, copied_ro) = match context.class_cache.lookup(data_ptr) {
        Some(cached) => (cached, None),
        None => {
            let (flags, data_ro) = if is_64 {
                let rw: Objc2ClassDataRw64 = read_task_struct(task, data_ptr)?;
                (rw.flags.get(bo), rw.data_ro.get(bo))
            } else {
                let rw: Objc2ClassDataRw32 = read_task_struct(task, data_ptr)?;
                (rw.flags.get(bo), rw.data_ro.get(bo) as u64)
            };
            // Unrealized classes have no usable ro data yet; skip silently.
            if flags & RW_REALIZED == 0 {
                return Ok(());
            }
            context.class_cache.insert(data_ptr, data_ro);
            (data_ro, Some(flags & RW_COPIED_RO != 0))
        }
    };

    let ro = read_class_ro(task, context, image, data_ro_addr, copied_ro)?;

    let mut class_name_buf = [0u8; CLASS_NAME_MAX];
    let class_name = task.read_cstr(ro.name, &mut class_name_buf)?;

    if ro.base_methods == 0 {
        return Ok(());
    }
    let header: Objc2ListHeader =
        match context
            .objc_const
            .as_ref()
            .and_then(|m| m.remap_struct::<Objc2ListHeader>(ro.base_methods, 0))
        {
            Some(header) => *header,
            None => read_task_struct(task, ro.base_methods)?,
        };
    // The low entsize bits carry list flags.
    let entsize = (header.entsize.get(bo) & !3u32) as u64;
    let count = header.count.get(bo).min(MAX_METHODS);
    let method_size = if is_64 {
        core::mem::size_of::<Objc2Method64>() as u64
    } else {
        core::mem::size_of::<Objc2Method32>() as u64
    };
    if entsize < method_size {
        return Err(Error::InvalidData);
    }

    let list_start = ro.base_methods + core::mem::size_of::<Objc2ListHeader>() as u64;
    for i in 0..count as u64 {
        let method_addr = list_start + i * entsize;
        let (name_ptr, imp) = if is_64 {
            let m: Objc2Method64 = match context
                .objc_const
                .as_ref()
                .and_then(|mobj| mobj.remap_struct::<Objc2Method64>(method_addr, 0))
            {
                Some(m) => *m,
                None => read_task_struct(task, method_addr)?,
            };
            (m.name.get(bo), m.imp.get(bo))
        } else {
            let m: Objc2Method32 = match context
                .objc_const
                .as_ref()
                .and_then(|mobj| mobj.remap_struct::<Objc2Method32>(method_addr, 0))
            {
                Some(m) => *m,
                None => read_task_struct(task, method_addr)?,
            };
            (m.name.get(bo) as u64, m.imp.get(bo) as u64)
        };

        let mut method_name_buf = [0u8; METHOD_NAME_MAX];
        let method_name = task.read_cstr(name_ptr, &mut method_name_buf)?;
        callback(is_meta_class, class_name, method_name, imp);
    }
    Ok(())
}

/// Load the read-only class data. `copied_ro` of `Some(true)` means the rw
/// data flagged it as a heap copy (read it out of the task); `Some(false)`
/// means it must live in `__objc_const`; `None` (cache hit) probes the
/// section mapping first and falls back to a copy.
fn read_class_ro<T: TaskMemory + ?Sized>(
    task: &T,
    context: &ObjCContext,
    image: &MachImage,
    data_ro_addr: u64,
    copied_ro: Option<bool>,
) -> Result<ClassRo, Error> {
    fn load<S: FromBytes + AsBytes + Copy, T: TaskMemory + ?Sized>(
        task: &T,
        context: &ObjCContext,
        addr: u64,
        copied_ro: Option<bool>,
    ) -> Result<S, Error> {
        if copied_ro == Some(true) {
            return read_task_struct(task, addr);
        }
        match context
            .objc_const
            .as_ref()
            .and_then(|m| m.remap_struct::<S>(addr, 0))
        {
            Some(ro) => Ok(*ro),
            None => read_task_struct(task, addr),
        }
    }

    let bo = image.byte_order();
    if image.is_64() {
        let ro: Objc2ClassDataRo64 = load(task, context, data_ro_addr, copied_ro)?;
        Ok(ClassRo {
            name: ro.name.get(bo),
            base_methods: ro.base_methods.get(bo),
        })
    } else {
        let ro: Objc2ClassDataRo32 = load(task, context, data_ro_addr, copied_ro)?;
        Ok(ClassRo {
            name: ro.name.get(bo) as u64,
            base_methods: ro.base_methods.get(bo) as u64,
        })
    }
}
