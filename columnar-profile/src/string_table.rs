use crate::fast_hash_map::FastHashMap;
use crate::index::StringId;
use crate::proto;

/// Builder-side interning over the wire string table.
///
/// Strings are stored once in a single byte blob with parallel
/// (offset, length) columns; equal strings share one index. The first
/// interned string is always the empty string.
#[derive(Debug, Default)]
pub struct StringTableBuilder {
    index: FastHashMap<String, StringId>,
}

impl StringTableBuilder {
    pub fn new(strtab: &mut proto::StringTable) -> Self {
        let mut table = StringTableBuilder {
            index: FastHashMap::default(),
        };
        let empty = table.intern(strtab, "");
        debug_assert_eq!(empty, StringId::ZERO);
        table
    }

    pub fn intern(&mut self, strtab: &mut proto::StringTable, s: &str) -> StringId {
        // The borrowed &str key looks up against owned String keys
        // transparently, so the owned copy is only made on first sight.
        if let Some(id) = self.index.get(s) {
            return *id;
        }

        let id = StringId::from_u32(strtab.offset.len() as u32);
        strtab.offset.push(strtab.strings.len() as u32);
        strtab.length.push(s.len() as u32);
        strtab.strings.push_str(s);
        self.index.insert(s.to_string(), id);
        id
    }
}

/// Resolves a string index against a wire string table.
///
/// Panics on malformed tables; run the profile through the validator
/// first when the input is untrusted.
pub fn get_string(strtab: &proto::StringTable, id: StringId) -> &str {
    let index = id.as_u32() as usize;
    let offset = strtab.offset[index] as usize;
    let length = strtab.length[index] as usize;
    &strtab.strings[offset..offset + length]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes() {
        let mut strtab = proto::StringTable::default();
        let mut builder = StringTableBuilder::new(&mut strtab);

        let x = builder.intern(&mut strtab, "x");
        let y = builder.intern(&mut strtab, "y");
        let x2 = builder.intern(&mut strtab, "x");

        assert_eq!(x, StringId::from_u32(1));
        assert_eq!(y, StringId::from_u32(2));
        assert_eq!(x2, x);
        assert_eq!(get_string(&strtab, StringId::ZERO), "");
        assert_eq!(get_string(&strtab, x), "x");
        assert_eq!(get_string(&strtab, y), "y");
        assert_eq!(strtab.strings, "xy");
    }
}
