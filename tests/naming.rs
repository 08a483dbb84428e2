//! Tests for shard naming and the downstream lookup contract.

mod naming_tests {
    use ironshard::io::shard::{count_lines, open_shard, read_shard};
    use ironshard::naming::{NameHash, ShardNaming, temp_owner};
    use ironshard::testing::{SAMPLE_HEADER, gzip_bytes};
    use std::fs;
    use std::io::BufRead;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_known_names() {
        let naming = ShardNaming::default();
        assert_eq!(naming.hash("9606"), "8f168f3c9b27b2daf698a2a812e359e7");
        assert_eq!(naming.file_name("9606"), "8f168f3c9b27b2daf698a2a812e359e7-9606.txt.gz");

        let templated = ShardNaming::new("string/{key}", ".txt.gz");
        assert_eq!(templated.file_name("9606"), "52bffd3cee181b16280b8337a309f5fa-9606.txt.gz");
    }

    #[test]
    fn test_md5_names_match_url_keyed_cache() {
        let naming = ShardNaming::new(
            "https://stringdb-downloads.org/download/protein.links.detailed.v12.0/{key}.protein.links.detailed.v12.0.txt.gz",
            ".protein.links.detailed.v12.0.txt.gz",
        )
        .with_algorithm(NameHash::Md5);
        assert_eq!(naming.hash("9606"), "45e030cfa44fa764959d916a17d92c9b");
        assert_eq!(
            naming.file_name("9606"),
            "45e030cfa44fa764959d916a17d92c9b-9606.protein.links.detailed.v12.0.txt.gz"
        );
        let bare = ShardNaming::default().with_algorithm(NameHash::Md5);
        assert_eq!(bare.hash("9606"), "138163901f4859c9601f08cfa428efe1");
    }

    #[test]
    fn test_temp_names_carry_owner_pid() {
        let naming = ShardNaming::default();
        let temp = naming.temp_path(Path::new("/out"), "9606", 4242);
        let name = temp.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!(".tmp.4242.{}", naming.file_name("9606")));
        assert_eq!(temp_owner(name), Some(Some(4242)));
        assert_eq!(naming.parse_final(name), None);
        assert_eq!(temp_owner(&naming.file_name("9606")), None);
    }

    #[test]
    fn test_locate_and_read_shard() {
        let tmp = TempDir::new().unwrap();
        let naming = ShardNaming::default();
        assert!(naming.locate(tmp.path(), "9606").is_none());

        let body = format!("{SAMPLE_HEADER}\n9606.a 9606.b 1\n9606.c 9606.d 2\n");
        fs::write(naming.final_path(tmp.path(), "9606"), gzip_bytes(&body).unwrap()).unwrap();

        let path = naming.locate(tmp.path(), "9606").unwrap();
        let contents = read_shard(&path).unwrap();
        assert_eq!(contents.header, SAMPLE_HEADER);
        assert_eq!(contents.lines, vec!["9606.a 9606.b 1", "9606.c 9606.d 2"]);
        assert_eq!(count_lines(&path).unwrap(), (true, 2));

        let first = open_shard(&path).unwrap().lines().next().unwrap().unwrap();
        assert_eq!(first, SAMPLE_HEADER);
    }

    #[test]
    fn test_concatenated_members_read_as_one_shard() {
        let tmp = TempDir::new().unwrap();
        let naming = ShardNaming::default();
        let mut bytes = gzip_bytes(&format!("{SAMPLE_HEADER}\n562.a 562.b 1\n")).unwrap();
        bytes.extend(gzip_bytes("562.c 562.d 2\n").unwrap());
        let path = naming.final_path(tmp.path(), "562");
        fs::write(&path, bytes).unwrap();

        let contents = read_shard(&path).unwrap();
        assert_eq!(contents.lines, vec!["562.a 562.b 1", "562.c 562.d 2"]);
    }
}
